use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::model::{evaluate, FeedLabel, Rule};
use crate::storage::{Article, ArticleFlag, Database, RULES_KEY};

#[derive(Debug, Error)]
pub enum RuleError {
    /// The store could not be read
    #[error("Failed to load rules: {0}")]
    Store(String),
    /// The stored rule set is not valid JSON
    #[error("Invalid rule set: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Action name → flag update.
const ACTIONS: &[(&str, ArticleFlag, bool)] = &[
    ("favorite", ArticleFlag::Favorite, true),
    ("unfavorite", ArticleFlag::Favorite, false),
    ("hide", ArticleFlag::Hidden, true),
    ("unhide", ArticleFlag::Hidden, false),
    ("mark_read", ArticleFlag::Read, true),
    ("mark_unread", ArticleFlag::Read, false),
    ("read_later", ArticleFlag::ReadLater, true),
    ("remove_read_later", ArticleFlag::ReadLater, false),
];

/// Flag update performed by a named action, `None` for unknown names.
pub fn resolve_action(name: &str) -> Option<(ArticleFlag, bool)> {
    let name = name.trim();
    ACTIONS
        .iter()
        .find(|(action, _, _)| *action == name)
        .map(|(_, flag, value)| (*flag, *value))
}

/// Persistence the rule engine depends on.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Raw JSON array of rules, `None` if none were ever saved
    async fn load_rules_json(&self) -> anyhow::Result<Option<String>>;
    /// Name and category of every feed, keyed by feed ID
    async fn feed_labels(&self) -> anyhow::Result<HashMap<i64, FeedLabel>>;
    async fn set_article_flag(&self, article_id: i64, flag: ArticleFlag, value: bool)
        -> anyhow::Result<bool>;
}

#[async_trait]
impl RuleStore for Database {
    async fn load_rules_json(&self) -> anyhow::Result<Option<String>> {
        self.get_setting(RULES_KEY).await
    }

    async fn feed_labels(&self) -> anyhow::Result<HashMap<i64, FeedLabel>> {
        Ok(self
            .get_feeds()
            .await?
            .into_iter()
            .map(|feed| {
                (
                    feed.id,
                    FeedLabel {
                        name: feed.title.to_string(),
                        category: feed.category,
                    },
                )
            })
            .collect())
    }

    async fn set_article_flag(
        &self,
        article_id: i64,
        flag: ArticleFlag,
        value: bool,
    ) -> anyhow::Result<bool> {
        Database::set_article_flag(self, article_id, flag, value).await
    }
}

/// Decode a stored rule set. Blank input is an empty set.
pub fn parse_rules(json: &str) -> Result<Vec<Rule>, RuleError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

/// Replace the stored rule set.
pub async fn save_rules(db: &Database, rules: &[Rule]) -> anyhow::Result<()> {
    let json = serde_json::to_string(rules)?;
    db.set_setting(RULES_KEY, &json).await
}

/// Applies stored automation rules to newly fetched articles.
#[derive(Clone)]
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Enabled rules in stored order.
    pub async fn enabled_rules(&self) -> Result<Vec<Rule>, RuleError> {
        let json = self
            .store
            .load_rules_json()
            .await
            .map_err(|e| RuleError::Store(e.to_string()))?;
        let rules = match json {
            Some(json) => parse_rules(&json)?,
            None => Vec::new(),
        };
        Ok(rules.into_iter().filter(|rule| rule.enabled).collect())
    }

    /// Run enabled rules over `articles`, first matching rule wins per article.
    ///
    /// Returns the number of articles some rule matched.
    pub async fn apply_rules_to_articles(&self, articles: &[Article]) -> Result<usize, RuleError> {
        if articles.is_empty() {
            return Ok(0);
        }
        let rules = self.enabled_rules().await?;
        if rules.is_empty() {
            return Ok(0);
        }
        self.run(&rules, articles).await
    }

    /// Run a single rule over `articles` regardless of its `enabled` flag.
    pub async fn apply_rule(&self, rule: &Rule, articles: &[Article]) -> Result<usize, RuleError> {
        if articles.is_empty() {
            return Ok(0);
        }
        self.run(std::slice::from_ref(rule), articles).await
    }

    async fn run(&self, rules: &[Rule], articles: &[Article]) -> Result<usize, RuleError> {
        let labels = self
            .store
            .feed_labels()
            .await
            .map_err(|e| RuleError::Store(e.to_string()))?;
        let unknown_feed = FeedLabel::default();

        let mut matched = 0;
        for article in articles {
            let feed = labels.get(&article.feed_id).unwrap_or(&unknown_feed);
            let Some(rule) = rules
                .iter()
                .find(|rule| evaluate(&rule.conditions, article, feed))
            else {
                continue;
            };

            tracing::debug!(rule = %rule.name, article_id = article.id, "Rule matched");
            self.apply_actions(rule, article).await;
            matched += 1;
        }
        Ok(matched)
    }

    async fn apply_actions(&self, rule: &Rule, article: &Article) {
        for action in &rule.actions {
            let Some((flag, value)) = resolve_action(action) else {
                tracing::warn!(rule = %rule.name, action = %action, "Unknown rule action");
                continue;
            };
            if let Err(e) = self.store.set_article_flag(article.id, flag, value).await {
                tracing::warn!(
                    rule = %rule.name,
                    action = %action,
                    article_id = article.id,
                    error = %e,
                    "Rule action failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Condition, ConditionField};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        rules: Option<String>,
        labels: HashMap<i64, FeedLabel>,
        failing: Option<ArticleFlag>,
        writes: Mutex<Vec<(i64, ArticleFlag, bool)>>,
    }

    impl FakeStore {
        fn writes(&self) -> Vec<(i64, ArticleFlag, bool)> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuleStore for FakeStore {
        async fn load_rules_json(&self) -> anyhow::Result<Option<String>> {
            Ok(self.rules.clone())
        }

        async fn feed_labels(&self) -> anyhow::Result<HashMap<i64, FeedLabel>> {
            Ok(self.labels.clone())
        }

        async fn set_article_flag(
            &self,
            article_id: i64,
            flag: ArticleFlag,
            value: bool,
        ) -> anyhow::Result<bool> {
            if self.failing == Some(flag) {
                anyhow::bail!("disk full");
            }
            self.writes.lock().unwrap().push((article_id, flag, value));
            Ok(true)
        }
    }

    fn article(id: i64, title: &str) -> Article {
        Article {
            id,
            feed_id: 1,
            title: title.to_string(),
            url: format!("https://a.com/{id}"),
            image_url: String::new(),
            content: Arc::from(""),
            translated_title: String::new(),
            summary: String::new(),
            published_at: None,
            is_read: false,
            is_favorite: false,
            is_hidden: false,
            is_read_later: false,
            unique_id: String::new(),
        }
    }

    fn tech_labels() -> HashMap<i64, FeedLabel> {
        HashMap::from([(
            1,
            FeedLabel {
                name: "Daily".to_string(),
                category: "Tech".to_string(),
            },
        )])
    }

    fn rule(name: &str, title: &str, actions: &[&str]) -> Rule {
        Rule {
            name: name.to_string(),
            conditions: vec![
                Condition {
                    field: ConditionField::FeedCategory,
                    value: "Tech".to_string(),
                    ..Default::default()
                },
                Condition {
                    field: ConditionField::ArticleTitle,
                    value: title.to_string(),
                    ..Default::default()
                },
            ],
            actions: actions.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn engine_with(rules: &[Rule], failing: Option<ArticleFlag>) -> (RuleEngine, Arc<FakeStore>) {
        let store = Arc::new(FakeStore {
            rules: Some(serde_json::to_string(rules).unwrap()),
            labels: tech_labels(),
            failing,
            ..Default::default()
        });
        (RuleEngine::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_matching_article_gets_favorited() {
        let (engine, store) = engine_with(&[rule("ai", "AI", &["favorite"])], None);
        let articles = [article(1, "New AI model"), article(2, "Weather report")];

        let matched = engine.apply_rules_to_articles(&articles).await.unwrap();
        assert_eq!(matched, 1);
        assert_eq!(store.writes(), vec![(1, ArticleFlag::Favorite, true)]);
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let rules = [
            rule("first", "AI", &["mark_read"]),
            rule("second", "model", &["hide"]),
        ];
        let (engine, store) = engine_with(&rules, None);

        engine
            .apply_rules_to_articles(&[article(1, "New AI model")])
            .await
            .unwrap();
        assert_eq!(store.writes(), vec![(1, ArticleFlag::Read, true)]);
    }

    #[tokio::test]
    async fn test_disabled_rules_are_skipped() {
        let mut disabled = rule("off", "AI", &["hide"]);
        disabled.enabled = false;
        let (engine, store) = engine_with(&[disabled.clone()], None);

        let matched = engine
            .apply_rules_to_articles(&[article(1, "AI")])
            .await
            .unwrap();
        assert_eq!(matched, 0);
        assert!(store.writes().is_empty());

        // Running it explicitly ignores `enabled`
        let matched = engine.apply_rule(&disabled, &[article(1, "AI")]).await.unwrap();
        assert_eq!(matched, 1);
        assert_eq!(store.writes(), vec![(1, ArticleFlag::Hidden, true)]);
    }

    #[tokio::test]
    async fn test_action_failures_do_not_stop_other_actions() {
        let (engine, store) = engine_with(
            &[rule("multi", "AI", &["favorite", "teleport", "read_later"])],
            Some(ArticleFlag::Favorite),
        );

        let matched = engine
            .apply_rules_to_articles(&[article(1, "AI")])
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert_eq!(store.writes(), vec![(1, ArticleFlag::ReadLater, true)]);
    }

    #[tokio::test]
    async fn test_no_rules_stored() {
        let store = Arc::new(FakeStore::default());
        let engine = RuleEngine::new(store.clone());
        assert_eq!(engine.apply_rules_to_articles(&[article(1, "AI")]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let store = Arc::new(FakeStore {
            rules: Some("{not json".to_string()),
            ..Default::default()
        });
        let engine = RuleEngine::new(store);
        let err = engine
            .apply_rules_to_articles(&[article(1, "AI")])
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::Decode(_)));
    }

    #[test]
    fn test_action_table() {
        assert_eq!(resolve_action("favorite"), Some((ArticleFlag::Favorite, true)));
        assert_eq!(resolve_action("remove_read_later"), Some((ArticleFlag::ReadLater, false)));
        assert_eq!(resolve_action("mark_unread"), Some((ArticleFlag::Read, false)));
        assert_eq!(resolve_action("explode"), None);
    }

    #[tokio::test]
    async fn test_database_store_roundtrip() {
        let db = Database::open(":memory:").await.unwrap();
        save_rules(&db, &[rule("ai", "AI", &["favorite"])]).await.unwrap();

        let engine = RuleEngine::new(Arc::new(db.clone()));
        let rules = engine.enabled_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "ai");
    }
}
