use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::extract::extract_articles;
use super::parser::{FeedParser, ParseError, ParsedFeed};
use super::script::ScriptExecutor;
use super::translate::{configured_target_language, translate_titles, Translator};
use crate::cache::ContentCache;
use crate::rules::RuleEngine;
use crate::storage::{Database, Feed, NewArticle};
use crate::tasks::Reason;
use crate::util::{urls_match, KnownUrls};

/// Errors that end a single refresh attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The feed could not be downloaded, run or parsed
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The attempt deadline elapsed
    #[error("Timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),
    /// Articles could not be read or written
    #[error("Database error: {0}")]
    Persist(String),
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Persist(_))
    }
}

/// Outcome of one successful refresh.
#[derive(Debug)]
pub struct FetchReport {
    pub feed_id: i64,
    /// Items in the parsed feed
    pub parsed: usize,
    /// Items left after dedup against stored and in-batch articles
    pub new_articles: usize,
    /// Rows written by the upsert
    pub saved: usize,
    /// Stored articles whose missing body was filled from this fetch
    pub backfilled: usize,
    /// Content caching and rule application for the saved rows
    pub follow_up: Option<JoinHandle<()>>,
}

/// Time allowed for translating one batch of titles. Titles not reached in
/// time are saved untranslated.
pub const DEFAULT_TRANSLATION_BUDGET: Duration = Duration::from_secs(2);

/// One refresh of one feed. Implemented by [`Fetcher`]; the task manager
/// only depends on this trait.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch_one(&self, feed: &Feed, reason: Reason) -> Result<FetchReport, FetchError>;
}

/// Fetch pipeline: parse, extract, dedup, persist, then follow-ups.
#[derive(Clone)]
pub struct Fetcher {
    db: Database,
    parser: Arc<dyn FeedParser>,
    scripts: Option<Arc<dyn ScriptExecutor>>,
    translator: Option<Arc<dyn Translator>>,
    translation_budget: Duration,
    cache: Arc<ContentCache>,
    rules: RuleEngine,
}

impl Fetcher {
    pub fn new(db: Database, parser: Arc<dyn FeedParser>, cache: Arc<ContentCache>) -> Self {
        let rules = RuleEngine::new(Arc::new(db.clone()));
        Self {
            db,
            parser,
            scripts: None,
            translator: None,
            translation_budget: DEFAULT_TRANSLATION_BUDGET,
            cache,
            rules,
        }
    }

    /// Enable feeds backed by a custom script.
    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptExecutor>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    /// Enable title translation (still gated by the `translation_enabled` setting).
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_translation_budget(mut self, budget: Duration) -> Self {
        self.translation_budget = budget;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Parsed feed for this refresh, from cache for article clicks.
    async fn obtain(&self, feed: &Feed, reason: Reason) -> Result<Arc<ParsedFeed>, ParseError> {
        if reason == Reason::ArticleClick {
            if let Some(parsed) = self.cache.get_feed(feed.id) {
                tracing::debug!(feed_id = feed.id, "Using cached parse for article click");
                return Ok(parsed);
            }
        }

        let parsed = match feed.script_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(script) => {
                let executor = self.scripts.as_ref().ok_or_else(|| {
                    ParseError::Script("custom scripts are not enabled".to_string())
                })?;
                executor.run(script).await?
            }
            None => self.parser.parse_url(&feed.url, feed.proxy()).await?,
        };

        let parsed = Arc::new(parsed);
        self.cache.set_feed(feed.id, Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Drop articles already stored for the feed or repeated within the batch.
    async fn dedup(
        &self,
        feed_id: i64,
        articles: Vec<NewArticle>,
    ) -> Result<Vec<NewArticle>, FetchError> {
        let stored_urls = self
            .db
            .get_article_urls_for_feed(feed_id)
            .await
            .map_err(|e| FetchError::Persist(e.to_string()))?;
        let mut known: KnownUrls = stored_urls.iter().collect();
        let mut unique_ids: HashSet<String> = self
            .db
            .get_unique_ids_for_feed(feed_id)
            .await
            .map_err(|e| FetchError::Persist(e.to_string()))?
            .into_iter()
            .collect();

        let fresh: Vec<NewArticle> = articles
            .into_iter()
            .filter(|article| {
                if known.contains(&article.url) {
                    return false;
                }
                // Identity by title and day is only meaningful with a real date
                if article.published_at.is_some() && !unique_ids.insert(article.unique_id.clone()) {
                    return false;
                }
                known.insert(&article.url);
                true
            })
            .collect();
        Ok(fresh)
    }

    /// Fill the body of stored articles that were saved without one, from
    /// matching items of this fetch. Returns the number of rows updated.
    async fn backfill_content(&self, feed_id: i64, articles: &[NewArticle]) -> usize {
        let missing = match self.db.get_articles_missing_content(feed_id).await {
            Ok(missing) => missing,
            Err(e) => {
                tracing::warn!(feed_id, error = %e, "Failed to look up articles without content");
                return 0;
            }
        };

        let mut filled = 0;
        for (article_id, url) in missing {
            let Some(source) = articles
                .iter()
                .find(|a| !a.content.is_empty() && urls_match(&a.url, &url))
            else {
                continue;
            };
            match self.db.set_article_content(article_id, &source.content).await {
                Ok(()) => {
                    self.cache.set(article_id, Arc::from(source.content.as_str()));
                    filled += 1;
                }
                Err(e) => {
                    tracing::warn!(article_id, error = %e, "Failed to back-fill article content");
                }
            }
        }
        filled
    }

    /// Translate titles within the translation budget.
    async fn translate(&self, articles: &mut [NewArticle]) {
        let Some(translator) = &self.translator else {
            return;
        };
        if articles.is_empty() {
            return;
        }
        let Some(target) = configured_target_language(&self.db).await else {
            return;
        };

        let budget = self.translation_budget;
        if tokio::time::timeout(budget, translate_titles(translator.as_ref(), &target, articles))
            .await
            .is_err()
        {
            let pending = articles.iter().filter(|a| a.translated_title.is_empty()).count();
            tracing::warn!(
                pending,
                budget_ms = budget.as_millis() as u64,
                "Title translation ran out of time"
            );
        }
    }

    fn spawn_follow_up(&self, saved: &[NewArticle]) -> JoinHandle<()> {
        let db = self.db.clone();
        let cache = Arc::clone(&self.cache);
        let rules = self.rules.clone();
        let urls: Vec<String> = saved.iter().map(|a| a.url.clone()).collect();

        tokio::spawn(async move {
            let rows = match db.get_articles_by_urls(&urls, urls.len()).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read back saved articles");
                    return;
                }
            };

            for row in &rows {
                if !row.content.is_empty() {
                    cache.set(row.id, Arc::clone(&row.content));
                }
            }

            match rules.apply_rules_to_articles(&rows).await {
                Ok(0) => {}
                Ok(matched) => tracing::info!(matched, "Automation rules applied"),
                Err(e) => tracing::warn!(error = %e, "Failed to apply automation rules"),
            }
        })
    }
}

#[async_trait]
impl FeedFetch for Fetcher {
    async fn fetch_one(&self, feed: &Feed, reason: Reason) -> Result<FetchReport, FetchError> {
        let parsed = self.obtain(feed, reason).await?;

        if let Err(e) = self.db.update_feed_error(feed.id, None).await {
            tracing::warn!(feed_id = feed.id, error = %e, "Failed to clear feed error");
        }
        if feed.image_url.is_empty() || feed.link.is_empty() {
            let image = Some(parsed.image_url.as_str()).filter(|s| !s.is_empty());
            let link = Some(parsed.link.as_str()).filter(|s| !s.is_empty());
            if image.is_some() || link.is_some() {
                if let Err(e) = self.db.update_feed_discovered(feed.id, image, link).await {
                    tracing::warn!(feed_id = feed.id, error = %e, "Failed to back-fill feed metadata");
                }
            }
        }

        let extracted = extract_articles(feed.id, &parsed.items);
        let backfilled = self.backfill_content(feed.id, &extracted).await;
        let mut fresh = self.dedup(feed.id, extracted).await?;
        self.translate(&mut fresh).await;

        let saved = self
            .db
            .save_articles(&fresh)
            .await
            .map_err(|e| FetchError::Persist(e.to_string()))?;

        tracing::info!(
            feed_id = feed.id,
            title = %feed.title,
            parsed = parsed.items.len(),
            new = fresh.len(),
            backfilled,
            reason = ?reason,
            "Feed refreshed"
        );

        let follow_up = (!fresh.is_empty()).then(|| self.spawn_follow_up(&fresh));

        Ok(FetchReport {
            feed_id: feed.id,
            parsed: parsed.items.len(),
            new_articles: fresh.len(),
            saved,
            backfilled,
            follow_up,
        })
    }
}
