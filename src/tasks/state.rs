use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use tokio::task::AbortHandle;

use super::{CancelSignal, Enqueue, Reason, RefreshTask, TaskInfo};
use crate::storage::Feed;

/// A task occupying a pool slot
#[derive(Debug)]
pub(crate) struct PoolEntry {
    pub info: TaskInfo,
    pub seq: u64,
    pub abort: Option<AbortHandle>,
}

/// Everything the scheduler mutates, kept behind one lock.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub queue: VecDeque<RefreshTask>,
    pub pool: HashMap<i64, PoolEntry>,
    /// Feeds running through `execute_immediately`
    pub immediate: HashSet<i64>,
    pub errors: BTreeMap<i64, String>,
    pub running: bool,
    pub stopped: bool,
    /// Incremented each time a new batch starts
    pub generation: u64,
    pub capacity: usize,
    /// Permits still to be retired after a capacity decrease
    pub pending_shrink: usize,
    next_seq: u64,
}

impl SchedulerState {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn new_task(
        &mut self,
        feed: Feed,
        reason: Reason,
        cancel: Option<CancelSignal>,
    ) -> RefreshTask {
        self.next_seq += 1;
        RefreshTask {
            feed,
            reason,
            created_at: Utc::now(),
            seq: self.next_seq,
            cancel,
        }
    }

    pub fn is_active(&self, feed_id: i64) -> bool {
        self.pool.contains_key(&feed_id) || self.immediate.contains(&feed_id)
    }

    pub fn queue_position(&self, feed_id: i64) -> Option<usize> {
        self.queue.iter().position(|task| task.feed.id == feed_id)
    }

    pub fn remove_queued(&mut self, feed_id: i64) -> Option<RefreshTask> {
        let index = self.queue_position(feed_id)?;
        self.queue.remove(index)
    }

    /// Start a new batch if none is running, returns true if one started.
    pub fn mark_running(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.generation += 1;
        true
    }

    pub fn push_head(&mut self, task: RefreshTask) -> Enqueue {
        if self.is_active(task.feed.id) {
            return Enqueue::AlreadyActive;
        }
        let outcome = match self.remove_queued(task.feed.id) {
            Some(_) => Enqueue::Moved,
            None => Enqueue::Inserted,
        };
        self.queue.push_front(task);
        self.mark_running();
        outcome
    }

    pub fn push_tail(&mut self, task: RefreshTask) -> Enqueue {
        if self.is_active(task.feed.id) {
            return Enqueue::AlreadyActive;
        }
        if self.queue_position(task.feed.id).is_some() {
            return Enqueue::AlreadyQueued;
        }
        self.queue.push_back(task);
        self.mark_running();
        Enqueue::Inserted
    }

    /// Remove a pool entry only if it still belongs to the task `seq`.
    pub fn remove_pool_entry(&mut self, feed_id: i64, seq: u64) -> bool {
        match self.pool.get(&feed_id) {
            Some(entry) if entry.seq == seq => {
                self.pool.remove(&feed_id);
                true
            }
            _ => false,
        }
    }

    /// Nothing queued, pooled or running immediately
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pool.is_empty() && self.immediate.is_empty()
    }

    /// Ends the running batch if everything is idle. Returns the finished
    /// generation exactly once per batch.
    pub fn try_complete(&mut self) -> Option<u64> {
        if self.running && self.is_idle() {
            self.running = false;
            Some(self.generation)
        } else {
            None
        }
    }

    /// Pool entries sorted by title, then creation time
    pub fn sorted_pool(&self) -> Vec<TaskInfo> {
        let mut pool: Vec<TaskInfo> = self.pool.values().map(|entry| entry.info.clone()).collect();
        pool.sort_by(|a, b| {
            a.title
                .cmp(&b.title)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.feed_id.cmp(&b.feed_id))
        });
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn feed(id: i64, title: &str) -> Feed {
        Feed {
            id,
            title: Arc::from(title),
            url: format!("https://example.com/{id}.xml"),
            link: String::new(),
            description: String::new(),
            category: String::new(),
            image_url: String::new(),
            script_path: None,
            last_updated: None,
            last_error: None,
            proxy_enabled: false,
            proxy_url: None,
        }
    }

    fn queued_ids(state: &SchedulerState) -> Vec<i64> {
        state.queue.iter().map(|t| t.feed.id).collect()
    }

    fn occupy_pool(state: &mut SchedulerState, id: i64) {
        let task = state.new_task(feed(id, "busy"), Reason::ScheduledGlobal, None);
        state.pool.insert(
            id,
            PoolEntry {
                info: task.info(),
                seq: task.seq,
                abort: None,
            },
        );
    }

    #[test]
    fn test_tail_insert_once() {
        let mut state = SchedulerState::new(5);
        let first = state.new_task(feed(1, "a"), Reason::ScheduledGlobal, None);
        let second = state.new_task(feed(1, "a"), Reason::ScheduledCustom, None);

        assert_eq!(state.push_tail(first), Enqueue::Inserted);
        assert_eq!(state.push_tail(second), Enqueue::AlreadyQueued);
        assert_eq!(queued_ids(&state), vec![1]);
        assert!(state.running);
        assert_eq!(state.generation, 1);
    }

    #[test]
    fn test_head_insert_on_pooled_feed_is_noop() {
        let mut state = SchedulerState::new(5);
        occupy_pool(&mut state, 1);
        let other = state.new_task(feed(2, "b"), Reason::ScheduledGlobal, None);
        state.push_tail(other);

        let task = state.new_task(feed(1, "a"), Reason::ManualRefresh, None);
        assert_eq!(state.push_head(task), Enqueue::AlreadyActive);
        assert_eq!(queued_ids(&state), vec![2]);
    }

    #[test]
    fn test_head_insert_moves_queued_feed() {
        let mut state = SchedulerState::new(5);
        for id in 1..=3 {
            let task = state.new_task(feed(id, "x"), Reason::ScheduledGlobal, None);
            state.push_tail(task);
        }

        let task = state.new_task(feed(3, "x"), Reason::ManualRefresh, None);
        assert_eq!(state.push_head(task), Enqueue::Moved);
        assert_eq!(queued_ids(&state), vec![3, 1, 2]);
        assert_eq!(state.queue[0].reason, Reason::ManualRefresh);
    }

    #[test]
    fn test_immediate_feed_counts_as_active() {
        let mut state = SchedulerState::new(5);
        state.immediate.insert(4);
        let task = state.new_task(feed(4, "x"), Reason::ScheduledGlobal, None);
        assert_eq!(state.push_tail(task), Enqueue::AlreadyActive);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn test_remove_pool_entry_checks_seq() {
        let mut state = SchedulerState::new(5);
        occupy_pool(&mut state, 1);
        let seq = state.pool[&1].seq;

        assert!(!state.remove_pool_entry(1, seq + 100));
        assert!(state.remove_pool_entry(1, seq));
        assert!(state.pool.is_empty());
    }

    #[test]
    fn test_completion_fires_once_per_batch() {
        let mut state = SchedulerState::new(5);
        assert_eq!(state.try_complete(), None);

        let task = state.new_task(feed(1, "x"), Reason::ScheduledGlobal, None);
        state.push_tail(task);
        assert_eq!(state.try_complete(), None);

        state.queue.clear();
        assert_eq!(state.try_complete(), Some(1));
        assert_eq!(state.try_complete(), None);

        let task = state.new_task(feed(1, "x"), Reason::ScheduledGlobal, None);
        state.push_tail(task);
        state.queue.clear();
        assert_eq!(state.try_complete(), Some(2));
    }

    #[test]
    fn test_sorted_pool() {
        let mut state = SchedulerState::new(5);
        for (id, title) in [(1, "zeta"), (2, "alpha"), (3, "mid")] {
            let task = state.new_task(feed(id, title), Reason::ScheduledGlobal, None);
            state.pool.insert(
                id,
                PoolEntry {
                    info: task.info(),
                    seq: task.seq,
                    abort: None,
                },
            );
        }
        let titles: Vec<String> = state.sorted_pool().iter().map(|t| t.title.to_string()).collect();
        assert_eq!(titles, vec!["alpha", "mid", "zeta"]);
    }
}
