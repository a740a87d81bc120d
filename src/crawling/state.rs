//! # Run Statistics
//!
//! Lock-free counters shared by all workers, plus the summary handed back
//! when a run ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::crawl_task::{CrawlTask, TaskStatus};
use crate::domain::product::UpsertOutcome;

/// Counters updated by workers while a run is in progress
#[derive(Debug)]
pub struct RunStats {
    started: Instant,
    tasks_started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    quarantined: AtomicU64,
    retries: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    unchanged: AtomicU64,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            tasks_started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            created: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub tasks_started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub retries: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl StatsSnapshot {
    pub fn pages_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.succeeded as f64 / seconds
        } else {
            0.0
        }
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &UpsertOutcome) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            UpsertOutcome::Created { .. } => &self.created,
            UpsertOutcome::Updated { .. } => &self.updated,
            UpsertOutcome::Unchanged { .. } => &self.unchanged,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantine(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed: self.started.elapsed(),
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
        }
    }
}

/// A URL that did not end in success
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnfinishedUrl {
    pub url: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl From<&CrawlTask> for UnfinishedUrl {
    fn from(task: &CrawlTask) -> Self {
        Self {
            url: task.url.to_string(),
            status: task.status,
            retry_count: task.retry_count,
            last_error: task.last_error.clone(),
        }
    }
}

/// Returned by `PipelineOrchestrator::run`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub quarantined: Vec<UnfinishedUrl>,
    pub failed: Vec<UnfinishedUrl>,
    /// Still queued when a cancelled run stopped
    pub pending: Vec<UnfinishedUrl>,
    /// Entries soft-expired after the run
    pub expired: u64,
    /// The run stopped on cancellation before the queue drained
    pub cancelled: bool,
}

impl RunSummary {
    pub fn from_tasks(stats: StatsSnapshot, tasks: &[CrawlTask], expired: u64, cancelled: bool) -> Self {
        let collect = |status: TaskStatus| {
            tasks
                .iter()
                .filter(|t| t.status == status)
                .map(UnfinishedUrl::from)
                .collect::<Vec<_>>()
        };
        Self {
            stats,
            quarantined: collect(TaskStatus::Quarantined),
            failed: collect(TaskStatus::Failed),
            pending: collect(TaskStatus::Pending),
            expired,
            cancelled,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.quarantined.is_empty() && self.failed.is_empty() && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn test_outcomes_are_counted() {
        let stats = RunStats::new();
        stats.record_start();
        stats.record_outcome(&UpsertOutcome::Created { revision: 1 });
        stats.record_outcome(&UpsertOutcome::Unchanged { revision: 1 });
        stats.record_retry();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.created, 1);
        assert_eq!(snapshot.unchanged, 1);
        assert_eq!(snapshot.retries, 1);
    }

    #[test]
    fn test_summary_lists_unfinished_urls() {
        let mut bad = CrawlTask::new(Url::parse("https://shop.example/bad").unwrap());
        bad.start().unwrap();
        bad.fail("HTTP 404").unwrap();
        bad.schedule_retry(0).unwrap();
        let good = CrawlTask::new(Url::parse("https://shop.example/good").unwrap());

        let summary = RunSummary::from_tasks(RunStats::new().snapshot(), &[bad, good], 0, false);
        assert_eq!(summary.quarantined.len(), 1);
        assert_eq!(summary.quarantined[0].last_error.as_deref(), Some("HTTP 404"));
        assert!(!summary.is_clean());
    }
}
