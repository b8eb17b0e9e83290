//! Entry points for requesting refreshes.
//!
//! [`Refresher`] maps each kind of request to a queue position and
//! [`Reason`], then hands it to the [`TaskManager`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::ContentCache;
use crate::storage::{Database, Feed};
use crate::tasks::{
    is_cancelled, CancelSignal, Enqueue, Progress, Reason, TaskError, TaskManager, TaskSnapshot,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("Database error: {0}")]
    Store(String),
}

fn store_error(e: anyhow::Error) -> RefreshError {
    RefreshError::Store(e.to_string())
}

#[derive(Clone)]
pub struct Refresher {
    db: Database,
    cache: Arc<ContentCache>,
    tasks: TaskManager,
}

impl Refresher {
    pub fn new(db: Database, cache: Arc<ContentCache>, tasks: TaskManager) -> Self {
        Self { db, cache, tasks }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Queue every subscribed feed for a periodic refresh.
    ///
    /// Returns the number of feeds queued.
    pub async fn fetch_all(&self, cancel: Option<CancelSignal>) -> Result<usize, RefreshError> {
        if is_cancelled(cancel.as_ref()) {
            return Err(TaskError::Cancelled.into());
        }
        let feeds = self.db.get_feeds().await.map_err(store_error)?;
        if feeds.is_empty() {
            tracing::debug!("No feeds to refresh");
            return Ok(0);
        }
        Ok(self.tasks.add_global_refresh(feeds, cancel).await?)
    }

    /// Refresh one feed: manual requests jump the queue, scheduled ones wait
    /// their turn.
    pub fn fetch_single_feed(
        &self,
        cancel: Option<CancelSignal>,
        feed: Feed,
        is_manual: bool,
    ) -> Result<Enqueue, RefreshError> {
        if is_cancelled(cancel.as_ref()) {
            return Err(TaskError::Cancelled.into());
        }
        let outcome = if is_manual {
            self.tasks
                .add_to_queue_head(feed, Reason::ManualRefresh, cancel)?
        } else {
            self.tasks
                .add_to_queue_tail(feed, Reason::ScheduledCustom, cancel)?
        };
        Ok(outcome)
    }

    /// Refresh newly added feeds ahead of everything queued.
    ///
    /// The feeds run in the order of `ids`. Unknown IDs are skipped. Returns
    /// the number of feeds that were queued or moved.
    pub async fn fetch_feeds_by_ids(
        &self,
        cancel: Option<CancelSignal>,
        ids: &[i64],
    ) -> Result<usize, RefreshError> {
        if is_cancelled(cancel.as_ref()) {
            return Err(TaskError::Cancelled.into());
        }
        let mut by_id: HashMap<i64, Feed> = self
            .db
            .get_feeds_by_ids(ids)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(|feed| (feed.id, feed))
            .collect();

        // Pushing to the head in reverse leaves the first ID at the front
        let mut queued = 0;
        for id in ids.iter().rev() {
            let Some(feed) = by_id.remove(id) else {
                continue;
            };
            if self
                .tasks
                .add_to_queue_head(feed, Reason::ManualAdd, cancel.clone())?
                .changed()
            {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Refresh the feed behind an article the user just opened, bypassing
    /// the queue.
    pub fn fetch_feed_for_article(
        &self,
        cancel: Option<CancelSignal>,
        feed: Feed,
    ) -> Result<Enqueue, RefreshError> {
        if is_cancelled(cancel.as_ref()) {
            return Err(TaskError::Cancelled.into());
        }
        Ok(self.tasks.execute_immediately(feed)?)
    }

    /// Body of an article, from the cache or the store.
    ///
    /// When neither has it, an immediate refresh of the owning feed is started
    /// and `None` is returned; callers retry once the refresh completes.
    pub async fn article_content(&self, article_id: i64) -> Result<Option<Arc<str>>, RefreshError> {
        if let Some(content) = self.cache.get(article_id) {
            return Ok(Some(content));
        }

        let Some(article) = self
            .db
            .get_article_by_id(article_id)
            .await
            .map_err(store_error)?
        else {
            return Ok(None);
        };

        if !article.content.is_empty() {
            self.cache.set(article.id, Arc::clone(&article.content));
            return Ok(Some(article.content));
        }

        match self
            .db
            .get_feed_by_id(article.feed_id)
            .await
            .map_err(store_error)?
        {
            Some(feed) => {
                tracing::debug!(article_id, feed_id = feed.id, "Article content missing, refreshing feed");
                self.fetch_feed_for_article(None, feed)?;
            }
            None => tracing::warn!(article_id, "Article has no owning feed"),
        }
        Ok(None)
    }

    pub fn progress(&self) -> Progress {
        self.tasks.progress()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.tasks.snapshot()
    }

    pub async fn wait_idle(&self) {
        self.tasks.wait_idle().await;
    }

    pub async fn stop(&self, cancel: CancelSignal) -> Result<(), RefreshError> {
        Ok(self.tasks.stop(cancel).await?)
    }
}
