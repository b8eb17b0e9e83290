//! Refresh task orchestration.
//!
//! Every refresh request becomes a [`RefreshTask`] that lives in exactly one
//! place at a time:
//!
//! ```text
//!   add_to_queue_head ──┐
//!   add_to_queue_tail ──┼─> Queue ──dispatch──> Pool ──> fetch ──> done
//!   add_global_refresh ─┘   (ordered)           (≤ capacity)
//!
//!   execute_immediately ─────────────────────> immediate ──> fetch ──> done
//! ```
//!
//! A feed ID is never in more than one of Queue, Pool and the immediate set.
//! When the last task of a batch finishes, the [`Cleanup`] collaborator is
//! asked to run exactly once.

mod manager;
mod oplog;
mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;

use crate::storage::Feed;

pub use manager::{TaskManager, TaskOptions, DEFAULT_ATTEMPT_TIMEOUTS, DEFAULT_POOL_CAPACITY, MAX_POOL_CAPACITY};
pub use oplog::OpCode;

/// Why a feed is being refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Feed was just subscribed to
    ManualAdd,
    /// User asked for this feed
    ManualRefresh,
    /// Feed with its own refresh interval came due
    ScheduledCustom,
    /// Periodic refresh of every feed
    ScheduledGlobal,
    /// User opened an article whose content is missing
    ArticleClick,
}

/// Cooperative cancellation: `true` once cancelled.
pub type CancelSignal = watch::Receiver<bool>;

/// Create a cancellation sender and its signal.
pub fn cancel_pair() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

pub(crate) fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(|c| *c.borrow())
}

/// Resolves once `cancel` fires. Never resolves if the sender is dropped
/// without cancelling.
pub(crate) async fn cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A pending refresh of one feed
#[derive(Debug, Clone)]
pub struct RefreshTask {
    pub feed: Feed,
    pub reason: Reason,
    pub created_at: DateTime<Utc>,
    pub(crate) seq: u64,
    pub(crate) cancel: Option<CancelSignal>,
}

impl RefreshTask {
    pub fn feed_id(&self) -> i64 {
        self.feed.id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        is_cancelled(self.cancel.as_ref())
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            feed_id: self.feed.id,
            title: Arc::clone(&self.feed.title),
            reason: self.reason,
            created_at: self.created_at,
        }
    }
}

/// Outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// New queue entry created
    Inserted,
    /// Existing queue entry moved to the head
    Moved,
    /// Feed is already being fetched
    AlreadyActive,
    /// Feed is already waiting in the queue
    AlreadyQueued,
}

impl Enqueue {
    /// Whether the queue changed
    pub fn changed(self) -> bool {
        matches!(self, Enqueue::Inserted | Enqueue::Moved)
    }
}

/// Batch progress as seen by a UI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub is_running: bool,
    /// Last error per feed ID for the current batch
    pub errors: BTreeMap<i64, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub feed_id: i64,
    pub title: Arc<str>,
    pub reason: Reason,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    /// Queue in dispatch order
    pub queue: Vec<TaskInfo>,
    /// Running tasks sorted by title, then creation time
    pub pool: Vec<TaskInfo>,
    /// Feed IDs running outside the pool
    pub immediate: Vec<i64>,
    pub capacity: usize,
    pub generation: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The manager was stopped and accepts no more work
    #[error("Task manager is stopped")]
    Stopped,
    /// The caller's cancel signal fired first
    #[error("Operation cancelled")]
    Cancelled,
}

/// Receives the end-of-batch signal.
///
/// Called with the scheduler lock held: implementations must return
/// promptly and must not call back into the task manager.
pub trait Cleanup: Send + Sync {
    fn request_cleanup(&self);
}
