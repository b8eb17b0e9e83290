//! Old-article purge, triggered once per finished refresh batch.

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::{Database, MAX_ARTICLE_AGE_DAYS_KEY};
use crate::tasks::Cleanup;

/// Retention used when neither the settings table nor the config file set one
pub const DEFAULT_MAX_ARTICLE_AGE_DAYS: u32 = 30;

const SECONDS_PER_DAY: i64 = 86_400;

/// Background purge of articles past the retention window.
///
/// Requests arriving while a purge is pending collapse into one run.
#[derive(Debug, Clone)]
pub struct CleanupWorker {
    tx: mpsc::Sender<()>,
}

impl CleanupWorker {
    /// Start the worker. It exits once every handle is dropped.
    pub fn spawn(db: Database, default_max_age_days: u32) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                match run_cleanup(&db, default_max_age_days).await {
                    Ok(0) => tracing::debug!("Cleanup found nothing to delete"),
                    Ok(deleted) => tracing::info!(deleted, "Old articles deleted"),
                    Err(e) => tracing::warn!(error = %e, "Article cleanup failed"),
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl Cleanup for CleanupWorker {
    fn request_cleanup(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::debug!("Cleanup worker has shut down");
            }
        }
    }
}

/// Retention in days: the `max_article_age_days` setting, else `default`.
/// Zero disables the purge.
pub async fn max_article_age_days(db: &Database, default: u32) -> u32 {
    match db.get_setting(MAX_ARTICLE_AGE_DAYS_KEY).await {
        Ok(Some(value)) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(value = %value, "Ignoring invalid max_article_age_days setting");
            default
        }),
        Ok(None) => default,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read max_article_age_days setting");
            default
        }
    }
}

/// Delete articles older than the retention window, returns rows deleted.
///
/// Favorites and read-later articles are kept regardless of age.
pub async fn run_cleanup(db: &Database, default_max_age_days: u32) -> Result<u64> {
    let days = max_article_age_days(db, default_max_age_days).await;
    if days == 0 {
        return Ok(0);
    }
    let cutoff = Utc::now().timestamp() - i64::from(days) * SECONDS_PER_DAY;
    db.delete_articles_older_than(cutoff).await
}
