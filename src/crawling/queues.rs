//! # Crawl Task Queue
//!
//! One queue per run, deduplicated by URL. Tasks waiting out a backoff sit in
//! a delay heap and move to the ready list when due. `next()` returns `None`
//! once nothing is ready, nothing is delayed and nothing is in flight.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::domain::crawl_task::{CrawlTask, TaskStatus};

/// Result of offering a URL to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Enqueued,
    /// Already pending or in progress in this run
    AlreadyQueued,
    /// A finished task for the URL was reset to pending
    Refreshed,
    SkippedQuarantined,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub quarantined: usize,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, CrawlTask>,
    ready: VecDeque<String>,
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    sequence: u64,
    in_flight: usize,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((due, _, _))) = self.delayed.peek() {
            if *due > now {
                break;
            }
            if let Some(Reverse((_, _, url))) = self.delayed.pop() {
                self.ready.push_back(url);
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight == 0
    }
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

pub fn queue_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer `url`. Quarantined tasks are only revived with `revive_quarantined`.
    pub fn seed(&self, url: Url, revive_quarantined: bool) -> SeedOutcome {
        let key = queue_key(&url);
        let outcome = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.tasks.get_mut(&key) {
                None => {
                    let mut task = CrawlTask::new(url);
                    task.url.set_fragment(None);
                    state.tasks.insert(key.clone(), task);
                    state.ready.push_back(key.clone());
                    SeedOutcome::Enqueued
                }
                Some(task) => match task.status {
                    TaskStatus::Pending | TaskStatus::InProgress => SeedOutcome::AlreadyQueued,
                    TaskStatus::Succeeded | TaskStatus::Failed => {
                        if task.refresh().is_err() {
                            return SeedOutcome::AlreadyQueued;
                        }
                        state.ready.push_back(key.clone());
                        SeedOutcome::Refreshed
                    }
                    TaskStatus::Quarantined if revive_quarantined => {
                        if task.requeue().is_err() {
                            return SeedOutcome::SkippedQuarantined;
                        }
                        state.ready.push_back(key.clone());
                        SeedOutcome::Refreshed
                    }
                    TaskStatus::Quarantined => SeedOutcome::SkippedQuarantined,
                },
            }
        };
        debug!("Seed {} -> {:?}", key, outcome);
        self.changed.notify_waiters();
        outcome
    }

    /// Wait for the next ready task and mark it in progress.
    ///
    /// Returns `None` when the queue is closed or fully drained.
    pub async fn next(&self) -> Option<CrawlTask> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut guard = self.lock();
                let state = &mut *guard;
                if state.closed {
                    return None;
                }
                state.promote_due(Instant::now());

                while let Some(key) = state.ready.pop_front() {
                    let Some(task) = state.tasks.get_mut(&key) else {
                        continue;
                    };
                    if let Err(e) = task.start() {
                        warn!("Skipping queued task: {}", e);
                        continue;
                    }
                    let task = task.clone();
                    state.in_flight += 1;
                    return Some(task);
                }

                if state.is_drained() {
                    return None;
                }
                state
                    .delayed
                    .peek()
                    .map(|Reverse((due, _, _))| due.saturating_duration_since(Instant::now()))
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Record the final state of an in-flight task
    pub fn finish(&self, task: CrawlTask) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.tasks.insert(queue_key(&task.url), task);
        }
        self.changed.notify_waiters();
    }

    /// Put a task whose retry was scheduled back after `delay`
    pub fn retry_later(&self, task: CrawlTask, delay: Duration) {
        {
            let mut state = self.lock();
            let key = queue_key(&task.url);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.sequence += 1;
            let due = (Instant::now() + delay, state.sequence, key.clone());
            state.delayed.push(Reverse(due));
            state.tasks.insert(key, task);
        }
        self.changed.notify_waiters();
    }

    /// Stop handing out tasks; waiting callers get `None`
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    pub fn is_drained(&self) -> bool {
        self.lock().is_drained()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.lock();
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Quarantined => counts.quarantined += 1,
            }
        }
        counts
    }

    /// Every task this queue has seen, sorted by URL
    pub fn tasks(&self) -> Vec<CrawlTask> {
        let mut tasks: Vec<CrawlTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
        tasks
    }

    pub fn get(&self, url: &Url) -> Option<CrawlTask> {
        self.lock().tasks.get(&queue_key(url)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://shop.example{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_seed_is_deduplicated_by_url() {
        let queue = TaskQueue::new();
        assert_eq!(queue.seed(url("/a"), false), SeedOutcome::Enqueued);
        assert_eq!(queue.seed(url("/a#reviews"), false), SeedOutcome::AlreadyQueued);

        let task = queue.next().await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(queue.seed(url("/a"), false), SeedOutcome::AlreadyQueued);
        assert_eq!(queue.counts().in_progress, 1);
    }

    #[tokio::test]
    async fn test_finished_tasks_are_refreshed_and_quarantine_is_sticky() {
        let queue = TaskQueue::new();
        queue.seed(url("/a"), false);
        queue.seed(url("/b"), false);

        let mut a = queue.next().await.unwrap();
        a.succeed().unwrap();
        queue.finish(a);

        let mut b = queue.next().await.unwrap();
        b.fail("boom").unwrap();
        b.schedule_retry(0).unwrap();
        queue.finish(b);

        assert!(queue.is_drained());
        assert_eq!(queue.seed(url("/a"), false), SeedOutcome::Refreshed);
        assert_eq!(queue.seed(url("/b"), false), SeedOutcome::SkippedQuarantined);
        assert_eq!(queue.seed(url("/b"), true), SeedOutcome::Refreshed);
        assert_eq!(queue.get(&url("/b")).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_drained_queue_returns_none() {
        let queue = TaskQueue::new();
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_delayed_task_comes_back_after_delay() {
        let queue = Arc::new(TaskQueue::new());
        queue.seed(url("/a"), false);

        let mut task = queue.next().await.unwrap();
        task.fail("timeout").unwrap();
        task.schedule_retry(3).unwrap();
        let started = Instant::now();
        queue.retry_later(task, Duration::from_millis(50));

        let again = queue.next().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_close() {
        let queue = Arc::new(TaskQueue::new());
        queue.seed(url("/a"), false);
        let _held = queue.next().await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
    }
}
