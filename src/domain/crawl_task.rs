//! Crawl task entity and its state machine
//!
//! ```text
//! pending -> in_progress -> succeeded
//!                        -> failed -> pending      (budget remaining, after backoff)
//!                                  -> quarantined  (budget exhausted)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Unique identifier for a crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Quarantined,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(format!("Invalid task status: {other}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid task transition for {task_id}: {from} -> {to}")]
pub struct TaskTransitionError {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// What happened to a failed task once the retry budget was consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending; carries the 1-based retry attempt number
    Retry { attempt: u32 },
    Quarantine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub id: TaskId,
    pub url: Url,
    pub host: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlTask {
    pub fn new(url: Url) -> Self {
        let now = Utc::now();
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        Self {
            id: TaskId::new(),
            url,
            host,
            retry_count: 0,
            last_error: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, allowed: &[TaskStatus], to: TaskStatus) -> Result<(), TaskTransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TaskTransitionError {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TaskTransitionError> {
        self.transition(&[TaskStatus::Pending], TaskStatus::InProgress)
    }

    pub fn succeed(&mut self) -> Result<(), TaskTransitionError> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Succeeded)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskTransitionError> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Consult the retry budget for a failed task.
    ///
    /// With `retry_count < budget` the task returns to pending and the count
    /// grows by one; otherwise it is quarantined. A task therefore fails
    /// `budget + 1` times before quarantine.
    pub fn schedule_retry(&mut self, budget: u32) -> Result<RetryDecision, TaskTransitionError> {
        if self.retry_count < budget {
            self.transition(&[TaskStatus::Failed], TaskStatus::Pending)?;
            self.retry_count += 1;
            Ok(RetryDecision::Retry {
                attempt: self.retry_count,
            })
        } else {
            self.transition(&[TaskStatus::Failed], TaskStatus::Quarantined)?;
            Ok(RetryDecision::Quarantine)
        }
    }

    /// Reset a finished task for another crawl of the same URL
    pub fn refresh(&mut self) -> Result<(), TaskTransitionError> {
        self.transition(&[TaskStatus::Succeeded, TaskStatus::Failed], TaskStatus::Pending)?;
        self.retry_count = 0;
        self.last_error = None;
        Ok(())
    }

    /// Explicit operator requeue of a quarantined task
    pub fn requeue(&mut self) -> Result<(), TaskTransitionError> {
        self.transition(&[TaskStatus::Quarantined], TaskStatus::Pending)?;
        self.retry_count = 0;
        Ok(())
    }

    /// Succeeded, quarantined, or failed without a pending retry
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Succeeded | TaskStatus::Quarantined | TaskStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> CrawlTask {
        CrawlTask::new(Url::parse("https://Shop.Example/p/1").unwrap())
    }

    #[test]
    fn test_host_is_lowercased() {
        assert_eq!(task().host, "shop.example");
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        t.start().unwrap();
        t.succeed().unwrap();
        assert_eq!(t.status, TaskStatus::Succeeded);
        assert!(t.is_terminal());
    }

    #[test]
    fn test_budget_plus_one_failures_quarantine() {
        let budget = 3;
        let mut t = task();
        let mut failures = 0;
        loop {
            t.start().unwrap();
            t.fail("navigation timed out").unwrap();
            failures += 1;
            match t.schedule_retry(budget).unwrap() {
                RetryDecision::Retry { attempt } => assert_eq!(attempt, failures),
                RetryDecision::Quarantine => break,
            }
        }
        assert_eq!(failures, budget + 1);
        assert_eq!(t.status, TaskStatus::Quarantined);
        assert_eq!(t.last_error.as_deref(), Some("navigation timed out"));
        assert!(t.start().is_err());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut t = task();
        assert!(t.succeed().is_err());
        assert!(t.fail("x").is_err());
        assert!(t.refresh().is_err());
        assert!(t.requeue().is_err());
    }

    #[test]
    fn test_refresh_and_requeue() {
        let mut t = task();
        t.start().unwrap();
        t.succeed().unwrap();
        t.refresh().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);

        t.start().unwrap();
        t.fail("boom").unwrap();
        t.schedule_retry(0).unwrap();
        assert_eq!(t.status, TaskStatus::Quarantined);
        t.requeue().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn test_task_serializes_url_as_string() {
        let mut t = task();
        t.start().unwrap();
        t.fail("connection reset").unwrap();

        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["url"], "https://shop.example/p/1");
        let back: CrawlTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }
}
