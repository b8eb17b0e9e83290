use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::oplog::{OpCode, OpLog};
use super::state::{PoolEntry, SchedulerState};
use super::{
    cancelled, CancelSignal, Cleanup, Enqueue, Progress, Reason, RefreshTask, TaskError,
    TaskSnapshot,
};
use crate::feed::{FeedFetch, FetchError, FetchReport};
use crate::storage::{Database, Feed};

/// Concurrent refreshes when nothing else is configured
pub const DEFAULT_POOL_CAPACITY: usize = 5;
/// Upper bound for [`TaskManager::set_pool_capacity`]
pub const MAX_POOL_CAPACITY: usize = 30;
/// Deadline of each attempt; the list length is the attempt count
pub const DEFAULT_ATTEMPT_TIMEOUTS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub capacity: usize,
    pub attempt_timeouts: Vec<Duration>,
    /// Transition log, truncated when the manager is created
    pub op_log: Option<PathBuf>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            attempt_timeouts: DEFAULT_ATTEMPT_TIMEOUTS.to_vec(),
            op_log: None,
        }
    }
}

/// Priority queue plus bounded worker pool for feed refreshes.
///
/// Cheap to clone; clones share the same scheduler.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<SchedulerState>,
    permits: Arc<Semaphore>,
    /// Woken whenever the scheduler becomes idle
    idle: Notify,
    db: Database,
    fetcher: Arc<dyn FeedFetch>,
    cleanup: Arc<dyn Cleanup>,
    attempts: Vec<Duration>,
    oplog: OpLog,
    runtime: Handle,
}

impl TaskManager {
    /// Create a manager.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        db: Database,
        fetcher: Arc<dyn FeedFetch>,
        cleanup: Arc<dyn Cleanup>,
        options: TaskOptions,
    ) -> Self {
        let capacity = options.capacity.clamp(1, MAX_POOL_CAPACITY);
        let attempts = if options.attempt_timeouts.is_empty() {
            DEFAULT_ATTEMPT_TIMEOUTS.to_vec()
        } else {
            options.attempt_timeouts
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::new(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Notify::new(),
                db,
                fetcher,
                cleanup,
                attempts,
                oplog: OpLog::open(options.op_log.as_deref()),
                runtime: Handle::current(),
            }),
        }
    }

    /// Queue a feed ahead of everything else.
    ///
    /// A feed already waiting is moved to the head and takes the new reason.
    /// A feed already running is left alone.
    pub fn add_to_queue_head(
        &self,
        feed: Feed,
        reason: Reason,
        cancel: Option<CancelSignal>,
    ) -> Result<Enqueue, TaskError> {
        let outcome = {
            let mut state = self.inner.lock();
            if state.stopped {
                return Err(TaskError::Stopped);
            }
            let title = Arc::clone(&feed.title);
            let task = state.new_task(feed, reason, cancel);
            let outcome = state.push_head(task);
            if outcome.changed() {
                self.inner
                    .oplog
                    .record(OpCode::AddFront, state.pool.len(), state.queue.len(), &title);
            }
            outcome
        };

        if outcome.changed() {
            self.inner.dispatch();
        }
        Ok(outcome)
    }

    /// Queue a feed behind everything else, unless it is already queued or running.
    pub fn add_to_queue_tail(
        &self,
        feed: Feed,
        reason: Reason,
        cancel: Option<CancelSignal>,
    ) -> Result<Enqueue, TaskError> {
        let outcome = {
            let mut state = self.inner.lock();
            if state.stopped {
                return Err(TaskError::Stopped);
            }
            let title = Arc::clone(&feed.title);
            let task = state.new_task(feed, reason, cancel);
            let outcome = state.push_tail(task);
            if outcome.changed() {
                self.inner
                    .oplog
                    .record(OpCode::AddRear, state.pool.len(), state.queue.len(), &title);
            }
            outcome
        };

        if outcome.changed() {
            self.inner.dispatch();
        }
        Ok(outcome)
    }

    /// Queue every feed for a periodic refresh in random order.
    ///
    /// Clears all stored feed errors first. Feeds already queued or running
    /// are skipped. Returns the number of feeds queued.
    pub async fn add_global_refresh(
        &self,
        mut feeds: Vec<Feed>,
        cancel: Option<CancelSignal>,
    ) -> Result<usize, TaskError> {
        if self.inner.lock().stopped {
            return Err(TaskError::Stopped);
        }

        if let Err(e) = self.inner.db.clear_all_feed_errors().await {
            tracing::warn!(error = %e, "Failed to clear feed errors");
        }

        feeds.shuffle(&mut rand::rng());
        let total = feeds.len();

        let (inserted, generation) = {
            let mut state = self.inner.lock();
            if state.stopped {
                return Err(TaskError::Stopped);
            }
            state.errors.clear();

            let mut inserted = 0;
            for feed in feeds {
                let title = Arc::clone(&feed.title);
                let task = state.new_task(feed, Reason::ScheduledGlobal, cancel.clone());
                if state.push_tail(task) == Enqueue::Inserted {
                    inserted += 1;
                    self.inner
                        .oplog
                        .record(OpCode::AddRear, state.pool.len(), state.queue.len(), &title);
                }
            }
            (inserted, state.generation)
        };

        tracing::info!(inserted, total, generation, "Global refresh queued");
        if inserted > 0 {
            self.inner.dispatch();
        }
        Ok(inserted)
    }

    /// Refresh a feed right now, outside the pool and its capacity limit.
    ///
    /// Any queued or pooled refresh of the same feed is discarded first.
    pub fn execute_immediately(&self, feed: Feed) -> Result<Enqueue, TaskError> {
        let (task, evicted) = {
            let mut state = self.inner.lock();
            if state.stopped {
                return Err(TaskError::Stopped);
            }
            if state.immediate.contains(&feed.id) {
                return Ok(Enqueue::AlreadyActive);
            }

            if state.remove_queued(feed.id).is_some() {
                tracing::debug!(feed_id = feed.id, "Dropped queued refresh for immediate run");
            }
            let evicted = state.pool.remove(&feed.id).and_then(|entry| entry.abort);

            state.immediate.insert(feed.id);
            state.mark_running();
            (state.new_task(feed, Reason::ArticleClick, None), evicted)
        };

        if let Some(abort) = evicted {
            tracing::debug!(feed_id = task.feed.id, "Aborting pooled refresh for immediate run");
            abort.abort();
        }

        let inner = Arc::clone(&self.inner);
        let exit = ImmediateExit {
            inner: Arc::clone(&inner),
            feed_id: task.feed.id,
        };
        self.inner.runtime.spawn(async move {
            let _exit = exit;
            inner.run_attempts(&task).await;
        });
        Ok(Enqueue::Inserted)
    }

    /// Stop accepting work, drop the queue and wait for running refreshes.
    ///
    /// Running refreshes finish their current attempt but are not retried.
    /// Returns [`TaskError::Cancelled`] if `cancel` fires before they finish.
    pub async fn stop(&self, mut cancel: CancelSignal) -> Result<(), TaskError> {
        let dropped = {
            let mut state = self.inner.lock();
            state.stopped = true;
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        tracing::info!(dropped, "Task manager stopping");
        self.inner.check_completion();

        tokio::select! {
            _ = self.wait_idle() => Ok(()),
            _ = cancelled(&mut cancel) => Err(TaskError::Cancelled),
        }
    }

    /// Resolves once nothing is queued, pooled or running immediately.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Change the pool capacity, clamped to `1..=MAX_POOL_CAPACITY`.
    ///
    /// Shrinking never interrupts running refreshes; the extra slots are
    /// retired as those refreshes finish. Returns the applied capacity.
    pub fn set_pool_capacity(&self, capacity: usize) -> usize {
        let capacity = capacity.clamp(1, MAX_POOL_CAPACITY);
        let added = {
            let mut state = self.inner.lock();
            let old = state.capacity;
            state.capacity = capacity;

            if capacity >= old {
                let grow = capacity - old;
                let absorbed = grow.min(state.pending_shrink);
                state.pending_shrink -= absorbed;
                grow - absorbed
            } else {
                let shrink = old - capacity;
                let forgotten = self.inner.permits.forget_permits(shrink);
                state.pending_shrink += shrink - forgotten;
                0
            }
        };

        if added > 0 {
            self.inner.permits.add_permits(added);
            self.inner.dispatch();
        }
        tracing::debug!(capacity, "Pool capacity changed");
        capacity
    }

    pub fn progress(&self) -> Progress {
        let state = self.inner.lock();
        Progress {
            is_running: state.running,
            errors: state.errors.clone(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.inner.lock();
        let mut immediate: Vec<i64> = state.immediate.iter().copied().collect();
        immediate.sort_unstable();
        TaskSnapshot {
            queue: state.queue.iter().map(RefreshTask::info).collect(),
            pool: state.sorted_pool(),
            immediate,
            capacity: state.capacity,
            generation: state.generation,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move queued tasks into the pool while permits are available.
    fn dispatch(self: &Arc<Self>) {
        while let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            let task = {
                let mut state = self.lock();

                if state.pending_shrink > 0 {
                    state.pending_shrink -= 1;
                    permit.forget();
                    continue;
                }

                let task = loop {
                    match state.queue.pop_front() {
                        Some(task) if task.is_cancelled() => {
                            tracing::debug!(feed_id = task.feed.id, "Skipping cancelled refresh");
                        }
                        other => break other,
                    }
                };
                let Some(task) = task else {
                    break;
                };

                state.pool.insert(
                    task.feed.id,
                    PoolEntry {
                        info: task.info(),
                        seq: task.seq,
                        abort: None,
                    },
                );
                self.oplog
                    .record(OpCode::Move, state.pool.len(), state.queue.len(), &task.feed.title);
                task
            };

            let (feed_id, seq) = (task.feed.id, task.seq);
            // Owned by the future itself, so the slot is released even if
            // the task is aborted before it is first polled
            let exit = PoolExit {
                inner: Arc::clone(self),
                feed_id,
                seq,
                permit: Some(permit),
            };
            let handle = self
                .runtime
                .spawn(run_pool_task(Arc::clone(self), task, exit));

            let stored = match self.lock().pool.get_mut(&feed_id) {
                Some(entry) if entry.seq == seq => {
                    entry.abort = Some(handle.abort_handle());
                    true
                }
                _ => false,
            };
            if !stored {
                // Evicted by an immediate run before the handle was stored
                handle.abort();
            }
        }

        self.check_completion();
    }

    /// Flip the batch to finished once everything is idle.
    fn check_completion(&self) {
        let mut state = self.lock();
        if !state.is_idle() {
            return;
        }
        if let Some(generation) = state.try_complete() {
            tracing::info!(generation, errors = state.errors.len(), "Refresh batch complete");
            self.cleanup.request_cleanup();
        }
        self.idle.notify_waiters();
    }

    fn should_abandon(&self, task: &RefreshTask) -> bool {
        self.lock().stopped || task.is_cancelled()
    }

    fn record_op(&self, op: OpCode, title: &str) {
        let state = self.lock();
        self.oplog.record(op, state.pool.len(), state.queue.len(), title);
    }

    /// Run the attempt list for one task and record the outcome.
    async fn run_attempts(&self, task: &RefreshTask) {
        let feed = &task.feed;
        let mut last_error = None;

        for (attempt, &limit) in self.attempts.iter().enumerate() {
            if attempt > 0 {
                if self.should_abandon(task) {
                    tracing::debug!(feed_id = feed.id, "Not retrying after stop or cancel");
                    break;
                }
                self.record_op(OpCode::Retry, &feed.title);
            }

            match tokio::time::timeout(limit, self.fetcher.fetch_one(feed, task.reason)).await {
                Ok(Ok(report)) => {
                    self.record_success(task, report).await;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        feed_id = feed.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Feed refresh attempt failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        feed_id = feed.id,
                        attempt = attempt + 1,
                        timeout_ms = limit.as_millis() as u64,
                        "Feed refresh attempt timed out"
                    );
                    last_error = Some(FetchError::Timeout(limit));
                }
            }
        }

        if let Some(error) = last_error {
            self.record_failure(task, &error).await;
        }
    }

    async fn record_success(&self, task: &RefreshTask, report: FetchReport) {
        let feed_id = task.feed.id;
        if let Err(e) = self.db.update_feed_error(feed_id, None).await {
            tracing::warn!(feed_id, error = %e, "Failed to clear feed error");
        }
        if let Err(e) = self.db.update_feed_last_updated(feed_id).await {
            tracing::warn!(feed_id, error = %e, "Failed to update feed timestamp");
        }

        {
            let mut state = self.lock();
            state.errors.remove(&feed_id);
            self.oplog
                .record(OpCode::Success, state.pool.len(), state.queue.len(), &task.feed.title);
        }
        tracing::debug!(feed_id, new = report.new_articles, "Refresh task succeeded");
    }

    async fn record_failure(&self, task: &RefreshTask, error: &FetchError) {
        let feed_id = task.feed.id;
        let message = error.to_string();
        if let Err(e) = self.db.update_feed_error(feed_id, Some(&message)).await {
            tracing::warn!(feed_id, error = %e, "Failed to store feed error");
        }
        if let Err(e) = self.db.update_feed_last_updated(feed_id).await {
            tracing::warn!(feed_id, error = %e, "Failed to update feed timestamp");
        }

        {
            let mut state = self.lock();
            state.errors.insert(feed_id, message);
            self.oplog
                .record(OpCode::Fail, state.pool.len(), state.queue.len(), &task.feed.title);
        }
        tracing::warn!(feed_id, title = %task.feed.title, error = %error, "Feed refresh failed");
    }
}

async fn run_pool_task(inner: Arc<Inner>, task: RefreshTask, _exit: PoolExit) {
    inner.run_attempts(&task).await;
}

/// Releases a pool slot when its worker ends, including by abort.
struct PoolExit {
    inner: Arc<Inner>,
    feed_id: i64,
    seq: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for PoolExit {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.remove_pool_entry(self.feed_id, self.seq);
            if let Some(permit) = self.permit.take() {
                if state.pending_shrink > 0 {
                    state.pending_shrink -= 1;
                    permit.forget();
                }
            }
        }
        self.inner.dispatch();
    }
}

struct ImmediateExit {
    inner: Arc<Inner>,
    feed_id: i64,
}

impl Drop for ImmediateExit {
    fn drop(&mut self) {
        self.inner.lock().immediate.remove(&self.feed_id);
        self.inner.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ParseError;
    use crate::storage::NewFeed;
    use crate::tasks::cancel_pair;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeFetch {
        delays: HashMap<i64, Duration>,
        failing: HashSet<i64>,
        persist_failing: HashSet<i64>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        started: Mutex<Vec<i64>>,
    }

    impl FakeFetch {
        fn started(&self) -> Vec<i64> {
            self.started.lock().unwrap().clone()
        }

        fn calls(&self, feed_id: i64) -> usize {
            self.started().iter().filter(|&&id| id == feed_id).count()
        }
    }

    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FeedFetch for FakeFetch {
        async fn fetch_one(&self, feed: &Feed, _reason: Reason) -> Result<FetchReport, FetchError> {
            self.started.lock().unwrap().push(feed.id);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let _active = ActiveGuard(&self.active);

            let delay = self
                .delays
                .get(&feed.id)
                .copied()
                .unwrap_or(Duration::from_millis(10));
            tokio::time::sleep(delay).await;

            if self.failing.contains(&feed.id) {
                return Err(FetchError::Parse(ParseError::Malformed("bad xml".into())));
            }
            if self.persist_failing.contains(&feed.id) {
                return Err(FetchError::Persist("disk full".into()));
            }
            Ok(FetchReport {
                feed_id: feed.id,
                parsed: 0,
                new_articles: 0,
                saved: 0,
                backfilled: 0,
                follow_up: None,
            })
        }
    }

    #[derive(Default)]
    struct CountingCleanup(AtomicUsize);

    impl Cleanup for CountingCleanup {
        fn request_cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingCleanup {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        db: Database,
        feeds: Vec<Feed>,
        fetch: Arc<FakeFetch>,
        cleanup: Arc<CountingCleanup>,
        manager: TaskManager,
    }

    async fn harness(n: usize, fetch: FakeFetch, options: TaskOptions) -> Harness {
        let db = Database::open(":memory:").await.unwrap();
        for i in 1..=n {
            db.insert_feed(&NewFeed {
                title: format!("Feed {i}"),
                url: format!("https://example.com/{i}.xml"),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let feeds = db.get_feeds().await.unwrap();
        let fetch = Arc::new(fetch);
        let cleanup = Arc::new(CountingCleanup::default());
        let manager = TaskManager::new(db.clone(), fetch.clone(), cleanup.clone(), options);
        Harness {
            db,
            feeds,
            fetch,
            cleanup,
            manager,
        }
    }

    fn with_capacity(capacity: usize) -> TaskOptions {
        TaskOptions {
            capacity,
            ..Default::default()
        }
    }

    async fn wait(manager: &TaskManager) {
        tokio::time::timeout(Duration::from_secs(10), manager.wait_idle())
            .await
            .expect("scheduler did not become idle");
    }

    fn queued(manager: &TaskManager) -> Vec<i64> {
        manager.snapshot().queue.iter().map(|t| t.feed_id).collect()
    }

    #[tokio::test]
    async fn test_tail_insert_creates_single_entry() {
        let h = harness(2, FakeFetch::default(), with_capacity(1)).await;
        let busy = h.feeds[0].clone();
        let waiting = h.feeds[1].clone();

        h.manager.add_to_queue_tail(busy, Reason::ScheduledGlobal, None).unwrap();
        let first = h
            .manager
            .add_to_queue_tail(waiting.clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        let second = h
            .manager
            .add_to_queue_tail(waiting.clone(), Reason::ScheduledCustom, None)
            .unwrap();

        assert_eq!(first, Enqueue::Inserted);
        assert_eq!(second, Enqueue::AlreadyQueued);
        assert_eq!(queued(&h.manager), vec![waiting.id]);
        wait(&h.manager).await;
    }

    #[tokio::test]
    async fn test_head_insert_of_running_feed_is_noop() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_millis(200));
        let h = harness(3, fetch, with_capacity(1)).await;

        h.manager
            .add_to_queue_tail(h.feeds[0].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        h.manager
            .add_to_queue_tail(h.feeds[1].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        let before = queued(&h.manager);

        let outcome = h
            .manager
            .add_to_queue_head(h.feeds[0].clone(), Reason::ManualRefresh, None)
            .unwrap();
        assert_eq!(outcome, Enqueue::AlreadyActive);
        assert_eq!(queued(&h.manager), before);
        wait(&h.manager).await;
    }

    #[tokio::test]
    async fn test_head_insert_moves_queued_feed() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_millis(100));
        let h = harness(4, fetch, with_capacity(1)).await;
        for feed in &h.feeds {
            h.manager
                .add_to_queue_tail(feed.clone(), Reason::ScheduledGlobal, None)
                .unwrap();
        }
        assert_eq!(queued(&h.manager), vec![2, 3, 4]);

        let outcome = h
            .manager
            .add_to_queue_head(h.feeds[3].clone(), Reason::ManualRefresh, None)
            .unwrap();
        assert_eq!(outcome, Enqueue::Moved);
        assert_eq!(queued(&h.manager), vec![4, 2, 3]);
        assert_eq!(h.manager.snapshot().queue[0].reason, Reason::ManualRefresh);

        wait(&h.manager).await;
        assert_eq!(h.fetch.started(), vec![1, 4, 2, 3]);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_capacity() {
        let mut fetch = FakeFetch::default();
        for id in 1..=8 {
            fetch.delays.insert(id, Duration::from_millis(30));
        }
        let h = harness(8, fetch, with_capacity(3)).await;

        let inserted = h.manager.add_global_refresh(h.feeds.clone(), None).await.unwrap();
        assert_eq!(inserted, 8);
        assert!(h.manager.snapshot().pool.len() <= 3);

        wait(&h.manager).await;
        assert_eq!(h.fetch.started().len(), 8);
        assert!(h.fetch.max_active.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_tail_order_with_single_slot() {
        let h = harness(3, FakeFetch::default(), with_capacity(1)).await;
        for feed in &h.feeds {
            h.manager
                .add_to_queue_tail(feed.clone(), Reason::ScheduledCustom, None)
                .unwrap();
        }

        wait(&h.manager).await;
        assert_eq!(h.fetch.started(), vec![1, 2, 3]);
        assert_eq!(h.fetch.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_fires_once_per_batch() {
        let h = harness(4, FakeFetch::default(), with_capacity(2)).await;

        h.manager.add_global_refresh(h.feeds.clone(), None).await.unwrap();
        assert!(h.manager.progress().is_running);
        wait(&h.manager).await;
        assert_eq!(h.cleanup.count(), 1);
        assert!(!h.manager.progress().is_running);

        h.manager
            .add_to_queue_head(h.feeds[0].clone(), Reason::ManualRefresh, None)
            .unwrap();
        wait(&h.manager).await;
        assert_eq!(h.cleanup.count(), 2);
        assert_eq!(h.manager.snapshot().generation, 2);
    }

    #[tokio::test]
    async fn test_timed_out_feed_records_error_while_siblings_succeed() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_secs(5));
        let h = harness(
            3,
            fetch,
            TaskOptions {
                capacity: 3,
                attempt_timeouts: vec![Duration::from_millis(50), Duration::from_millis(80)],
                op_log: None,
            },
        )
        .await;

        h.manager.add_global_refresh(h.feeds.clone(), None).await.unwrap();
        wait(&h.manager).await;

        assert_eq!(h.fetch.calls(1), 2);
        let progress = h.manager.progress();
        assert_eq!(progress.errors.keys().copied().collect::<Vec<_>>(), vec![1]);

        let slow = h.db.get_feed_by_id(1).await.unwrap().unwrap();
        assert!(slow.last_error.unwrap().contains("Timed out"));
        assert!(slow.last_updated.is_some());
        for id in [2, 3] {
            let feed = h.db.get_feed_by_id(id).await.unwrap().unwrap();
            assert_eq!(feed.last_error, None);
            assert!(feed.last_updated.is_some());
        }
    }

    #[tokio::test]
    async fn test_parse_errors_retry_but_persist_errors_do_not() {
        let mut fetch = FakeFetch::default();
        fetch.failing.insert(1);
        fetch.persist_failing.insert(2);
        let h = harness(2, fetch, with_capacity(2)).await;

        h.manager.add_global_refresh(h.feeds.clone(), None).await.unwrap();
        wait(&h.manager).await;

        assert_eq!(h.fetch.calls(1), DEFAULT_ATTEMPT_TIMEOUTS.len());
        assert_eq!(h.fetch.calls(2), 1);
        assert_eq!(h.manager.progress().errors.len(), 2);
    }

    #[tokio::test]
    async fn test_global_refresh_clears_previous_errors() {
        let mut fetch = FakeFetch::default();
        fetch.failing.insert(1);
        let h = harness(2, fetch, with_capacity(2)).await;
        h.db.update_feed_error(2, Some("old failure")).await.unwrap();

        h.manager.add_global_refresh(h.feeds.clone(), None).await.unwrap();
        wait(&h.manager).await;

        let progress = h.manager.progress();
        assert!(progress.errors.contains_key(&1));
        assert!(!progress.errors.contains_key(&2));
        assert_eq!(h.db.get_feed_by_id(2).await.unwrap().unwrap().last_error, None);
    }

    #[tokio::test]
    async fn test_cancelled_tasks_are_not_dispatched() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_millis(100));
        let h = harness(2, fetch, with_capacity(1)).await;
        let (cancel_tx, cancel) = cancel_pair();

        h.manager
            .add_to_queue_tail(h.feeds[0].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        h.manager
            .add_to_queue_tail(h.feeds[1].clone(), Reason::ScheduledGlobal, Some(cancel))
            .unwrap();
        cancel_tx.send(true).unwrap();

        wait(&h.manager).await;
        assert_eq!(h.fetch.started(), vec![1]);
        assert_eq!(h.cleanup.count(), 1);
    }

    #[tokio::test]
    async fn test_execute_immediately_bypasses_queue() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_millis(200));
        let h = harness(2, fetch, with_capacity(1)).await;

        h.manager
            .add_to_queue_tail(h.feeds[0].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        h.manager
            .add_to_queue_tail(h.feeds[1].clone(), Reason::ScheduledGlobal, None)
            .unwrap();

        let outcome = h.manager.execute_immediately(h.feeds[1].clone()).unwrap();
        assert_eq!(outcome, Enqueue::Inserted);
        let snapshot = h.manager.snapshot();
        assert!(snapshot.queue.is_empty());
        assert_eq!(snapshot.immediate, vec![2]);
        assert_eq!(
            h.manager.execute_immediately(h.feeds[1].clone()).unwrap(),
            Enqueue::AlreadyActive
        );

        wait(&h.manager).await;
        assert_eq!(h.fetch.calls(2), 1);
        assert_eq!(h.cleanup.count(), 1);
    }

    #[tokio::test]
    async fn test_execute_immediately_replaces_pooled_run() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_secs(5));
        let h = harness(2, fetch, with_capacity(1)).await;

        h.manager
            .add_to_queue_tail(h.feeds[0].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        h.manager
            .add_to_queue_tail(h.feeds[1].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        assert_eq!(h.manager.snapshot().pool.len(), 1);

        h.manager.execute_immediately(h.feeds[0].clone()).unwrap();
        let snapshot = h.manager.snapshot();
        assert!(snapshot.pool.iter().all(|t| t.feed_id != 1));
        assert_eq!(snapshot.immediate, vec![1]);

        // The aborted pool run frees its slot for feed 2
        tokio::time::timeout(Duration::from_millis(500), async {
            while h.fetch.calls(2) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queued feed was never dispatched");
    }

    #[tokio::test]
    async fn test_unstarted_pooled_run_frees_slot_when_replaced() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_millis(300));
        let h = harness(3, fetch, with_capacity(1)).await;

        for feed in &h.feeds {
            h.manager
                .add_to_queue_tail(feed.clone(), Reason::ScheduledGlobal, None)
                .unwrap();
        }
        // Feed 1 holds the only slot but its worker has not run yet
        assert_eq!(queued(&h.manager), vec![2, 3]);
        h.manager.execute_immediately(h.feeds[0].clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.fetch.calls(2), 1);
        assert_eq!(h.fetch.calls(3), 1);
        assert_eq!(h.manager.snapshot().immediate, vec![1]);

        wait(&h.manager).await;
        assert_eq!(h.fetch.calls(1), 1);
        assert_eq!(h.cleanup.count(), 1);
    }

    #[tokio::test]
    async fn test_stop_drains_and_rejects() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_millis(100));
        let h = harness(3, fetch, with_capacity(1)).await;
        for feed in &h.feeds {
            h.manager
                .add_to_queue_tail(feed.clone(), Reason::ScheduledGlobal, None)
                .unwrap();
        }

        let (_cancel_tx, cancel) = cancel_pair();
        h.manager.stop(cancel).await.unwrap();

        assert_eq!(h.fetch.started(), vec![1]);
        assert!(h.manager.snapshot().queue.is_empty());
        assert!(h.manager.is_stopped());
        assert_eq!(
            h.manager
                .add_to_queue_tail(h.feeds[1].clone(), Reason::ManualRefresh, None),
            Err(TaskError::Stopped)
        );
        assert_eq!(
            h.manager.execute_immediately(h.feeds[1].clone()),
            Err(TaskError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_stop_can_be_cancelled() {
        let mut fetch = FakeFetch::default();
        fetch.delays.insert(1, Duration::from_secs(30));
        let h = harness(
            1,
            fetch,
            TaskOptions {
                capacity: 1,
                attempt_timeouts: vec![Duration::from_secs(60)],
                op_log: None,
            },
        )
        .await;
        h.manager
            .add_to_queue_tail(h.feeds[0].clone(), Reason::ScheduledGlobal, None)
            .unwrap();

        let (cancel_tx, cancel) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel_tx.send(true);
        });

        assert_eq!(h.manager.stop(cancel).await, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn test_set_pool_capacity() {
        let mut fetch = FakeFetch::default();
        for id in 1..=4 {
            fetch.delays.insert(id, Duration::from_millis(150));
        }
        let h = harness(4, fetch, with_capacity(1)).await;

        assert_eq!(h.manager.set_pool_capacity(0), 1);
        assert_eq!(h.manager.set_pool_capacity(1000), MAX_POOL_CAPACITY);
        assert_eq!(h.manager.set_pool_capacity(1), 1);

        for feed in &h.feeds {
            h.manager
                .add_to_queue_tail(feed.clone(), Reason::ScheduledGlobal, None)
                .unwrap();
        }
        assert_eq!(h.manager.snapshot().pool.len(), 1);

        h.manager.set_pool_capacity(3);
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.pool.len(), 3);
        assert_eq!(snapshot.capacity, 3);

        wait(&h.manager).await;
        assert!(h.fetch.max_active.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_snapshot_pool_sorted_by_title() {
        let mut fetch = FakeFetch::default();
        for id in 1..=3 {
            fetch.delays.insert(id, Duration::from_millis(100));
        }
        let h = harness(3, fetch, with_capacity(3)).await;
        for feed in h.feeds.iter().rev() {
            h.manager
                .add_to_queue_tail(feed.clone(), Reason::ScheduledGlobal, None)
                .unwrap();
        }

        let titles: Vec<String> = h
            .manager
            .snapshot()
            .pool
            .iter()
            .map(|t| t.title.to_string())
            .collect();
        assert_eq!(titles, vec!["Feed 1", "Feed 2", "Feed 3"]);
        wait(&h.manager).await;
    }

    #[tokio::test]
    async fn test_op_log_lines() {
        let path = std::env::temp_dir().join(format!("refeed-manager-{}.log", std::process::id()));
        let h = harness(
            1,
            FakeFetch::default(),
            TaskOptions {
                op_log: Some(path.clone()),
                ..Default::default()
            },
        )
        .await;

        h.manager
            .add_to_queue_tail(h.feeds[0].clone(), Reason::ScheduledGlobal, None)
            .unwrap();
        wait(&h.manager).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "AR 0/1 Feed 1\nMV 1/0 Feed 1\nSC 1/0 Feed 1\n");
        std::fs::remove_file(&path).ok();
    }
}
