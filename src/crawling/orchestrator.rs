//! # Pipeline Orchestrator
//!
//! Drives every queued URL through session checkout, rate limiting,
//! navigation, extraction, normalization and reconciliation. A fixed number
//! of workers pull from the shared queue; failures are classified and either
//! retried after backoff, quarantined once the budget is spent, or failed
//! outright when another attempt cannot help.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::crawling::queues::{SeedOutcome, TaskQueue, queue_key};
use crate::crawling::rate_limiter::HostRateLimiter;
use crate::crawling::reconciler::Reconciler;
use crate::crawling::retry_policy::BackoffPolicy;
use crate::crawling::state::{RunStats, RunSummary};
use crate::domain::crawl_task::{CrawlTask, RetryDecision, TaskStatus};
use crate::domain::product::UpsertOutcome;
use crate::domain::ruleset::{AvailabilityKeywords, Ruleset};
use crate::infrastructure::browser::{SessionError, SessionPool};
use crate::infrastructure::catalog_repository::{CatalogStore, StoreError, TaskArchive};
use crate::infrastructure::config::PipelineConfig;
use crate::infrastructure::normalizer::{NormalizationError, Normalizer};
use crate::infrastructure::parsing::{CompiledRuleset, ExtractionError};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Ruleset rejected: {0}")]
    Ruleset(#[from] ExtractionError),

    #[error("Duplicate ruleset for source '{0}'")]
    DuplicateSource(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Why one attempt at a task failed
#[derive(Error, Debug)]
pub enum StageError {
    #[error("No ruleset matches host '{host}'")]
    NoRuleset { host: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task exceeded its {timeout_ms} ms deadline")]
    Timeout { timeout_ms: u64 },

    #[error("Task panicked: {message}")]
    Panicked { message: String },
}

impl StageError {
    /// Retry budget for this failure, or `None` when retrying cannot help
    pub fn retry_budget(&self, config: &PipelineConfig) -> Option<u32> {
        match self {
            Self::Session(e) if e.is_retryable() => Some(config.retry_budget),
            Self::Extraction(e) if e.is_recoverable() => Some(config.effective_extraction_budget()),
            Self::Store(e) if e.is_retryable() => Some(config.retry_budget),
            Self::Timeout { .. } => Some(config.retry_budget),
            _ => None,
        }
    }
}

/// Everything needed to process pages of one source
pub(crate) struct SourcePlan {
    pub(crate) ruleset: Ruleset,
    compiled: CompiledRuleset,
    normalizer: Normalizer,
}

pub(crate) struct PipelineInner {
    pub(crate) config: PipelineConfig,
    pub(crate) plans: Vec<SourcePlan>,
    pub(crate) pool: SessionPool,
    pub(crate) queue: TaskQueue,
    pub(crate) limiter: HostRateLimiter,
    pub(crate) archive: Arc<dyn TaskArchive>,
    reconciler: Reconciler,
    backoff: BackoffPolicy,
    stats: RunStats,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    pub(crate) inner: Arc<PipelineInner>,
}

impl PipelineOrchestrator {
    /// Compile every ruleset up front; a broken ruleset fails here, not mid-run
    pub fn new(
        config: PipelineConfig,
        rulesets: &[Ruleset],
        availability: &AvailabilityKeywords,
        pool: SessionPool,
        store: Arc<dyn CatalogStore>,
        archive: Arc<dyn TaskArchive>,
    ) -> Result<Self, OrchestratorError> {
        let mut plans: Vec<SourcePlan> = Vec::with_capacity(rulesets.len());
        for ruleset in rulesets {
            if plans.iter().any(|p| p.ruleset.source == ruleset.source) {
                return Err(OrchestratorError::DuplicateSource(ruleset.source.clone()));
            }
            plans.push(SourcePlan {
                compiled: CompiledRuleset::compile(ruleset)?,
                normalizer: Normalizer::new(ruleset, availability),
                ruleset: ruleset.clone(),
            });
        }

        info!(
            "🚀 Pipeline ready: {} sources, {} workers, retry budget {}",
            plans.len(),
            config.worker_count,
            config.retry_budget
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                limiter: HostRateLimiter::new(config.per_host_spacing()),
                backoff: BackoffPolicy::new(&config.backoff),
                reconciler: Reconciler::new(store),
                queue: TaskQueue::new(),
                stats: RunStats::new(),
                cancel: CancellationToken::new(),
                plans,
                pool,
                archive,
                config,
            }),
        })
    }

    /// Cancel this token to stop the run. Workers stop taking new tasks;
    /// tasks already in flight finish or hit their timeout.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Enqueue an already-validated URL, honoring quarantine stickiness
    pub async fn enqueue(&self, url: Url) -> Result<SeedOutcome, StoreError> {
        let revive = self.inner.config.allow_quarantine_reseed;
        if !revive && self.inner.queue.get(&url).is_none() {
            let key = queue_key(&url);
            if self.inner.archive.archived_status(&key).await? == Some(TaskStatus::Quarantined) {
                debug!("Skipping {} (quarantined in an earlier run)", key);
                return Ok(SeedOutcome::SkippedQuarantined);
            }
        }
        Ok(self.inner.queue.seed(url, revive))
    }

    /// Process the queue until it drains or the run is cancelled
    pub async fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let run_started = Utc::now();
        let worker_count = self.inner.config.worker_count.max(1);
        info!("▶️ Starting run with {} workers", worker_count);

        let reporter = self.start_stats_reporter();

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            workers.spawn(async move { inner.worker_loop(worker_id).await });
        }

        let mut worker_failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker panicked: {}", e);
                // The dead worker's task never settles; release the others
                self.inner.queue.close();
                worker_failure.get_or_insert_with(|| e.to_string());
            }
        }
        reporter.abort();

        let cancelled = self.inner.cancel.is_cancelled();
        if cancelled {
            self.inner.queue.close();
        }
        if let Some(message) = worker_failure {
            return Err(OrchestratorError::Worker(message));
        }

        let tasks = self.inner.queue.tasks();
        let mut expired = 0;
        if self.inner.config.expire_unseen && !cancelled {
            // Only sources this run actually reached
            let mut crawled: Vec<&str> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Succeeded)
                .filter_map(|t| self.inner.plan_for(&t.host))
                .map(|plan| plan.ruleset.source.as_str())
                .collect();
            crawled.sort_unstable();
            crawled.dedup();
            for source in crawled {
                expired += self.inner.reconciler.expire_unseen(source, run_started).await?;
            }
        }

        let summary = RunSummary::from_tasks(self.inner.stats.snapshot(), &tasks, expired, cancelled);
        info!(
            "🏁 Run finished: {} succeeded ({} created, {} updated, {} unchanged), {} quarantined, {} failed{}",
            summary.stats.succeeded,
            summary.stats.created,
            summary.stats.updated,
            summary.stats.unchanged,
            summary.quarantined.len(),
            summary.failed.len(),
            if cancelled { ", cancelled" } else { "" }
        );
        Ok(summary)
    }

    fn start_stats_reporter(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut ticker = interval(inner.config.stats_interval().max(std::time::Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = inner.stats.snapshot();
                        let counts = inner.queue.counts();
                        info!(
                            "📊 pending={} in_progress={} succeeded={} quarantined={} retries={} sessions={}/{} rate={:.2}/s",
                            counts.pending,
                            counts.in_progress,
                            stats.succeeded,
                            stats.quarantined,
                            stats.retries,
                            inner.pool.in_use(),
                            inner.pool.capacity(),
                            stats.pages_per_second()
                        );
                    }
                }
            }
        })
    }
}

impl PipelineInner {
    pub(crate) fn plan_for(&self, host: &str) -> Option<&SourcePlan> {
        self.plans.iter().find(|plan| plan.ruleset.matches_host(host))
    }

    pub(crate) fn plan_for_source(&self, source: &str) -> Option<&SourcePlan> {
        self.plans.iter().find(|plan| plan.ruleset.source == source)
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!("Worker {} started", worker_id);
        loop {
            let task = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = self.queue.next() => match next {
                    Some(task) => task,
                    None => break,
                },
            };

            // Cancellation stops dequeuing; the task in hand runs to completion or timeout
            self.stats.record_start();
            let timeout = self.config.task_timeout();
            let attempt = AssertUnwindSafe(self.process(&task)).catch_unwind();
            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => Err(StageError::Panicked {
                    message: panic_message(payload.as_ref()),
                }),
                Err(_) => Err(StageError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };
            self.settle(task, result).await;
        }
        debug!("Worker {} stopped", worker_id);
    }

    async fn process(&self, task: &CrawlTask) -> Result<UpsertOutcome, StageError> {
        let plan = self.plan_for(&task.host).ok_or_else(|| StageError::NoRuleset {
            host: task.host.clone(),
        })?;

        let page = {
            let mut session = self.pool.acquire(self.config.session_acquire_timeout()).await?;
            // Spacing is measured between navigations, not between checkouts
            self.limiter.until_ready(&task.host).await;
            session.navigate(&task.url, self.config.navigation_timeout()).await?
        };

        let record = plan.compiled.extract(&page)?;
        let product = plan.normalizer.normalize(&record)?;
        Ok(self.reconciler.upsert(product).await?)
    }

    async fn settle(&self, mut task: CrawlTask, result: Result<UpsertOutcome, StageError>) {
        match result {
            Ok(outcome) => {
                if let Err(e) = task.succeed() {
                    error!("{}", e);
                }
                debug!("✅ {} -> {}", task.url, outcome.as_str());
                self.stats.record_outcome(&outcome);
                self.archive_task(&task).await;
                self.queue.finish(task);
            }
            Err(stage_error) => {
                if let Err(e) = task.fail(stage_error.to_string()) {
                    error!("{}", e);
                }
                let Some(budget) = stage_error.retry_budget(&self.config) else {
                    warn!("❌ {} failed permanently: {}", task.url, stage_error);
                    self.stats.record_failure();
                    self.archive_task(&task).await;
                    self.queue.finish(task);
                    return;
                };

                match task.schedule_retry(budget) {
                    Ok(RetryDecision::Retry { attempt }) => {
                        let delay = self.backoff.delay_for(attempt);
                        warn!("🔄 {} failed ({}), retry {}/{} in {:?}", task.url, stage_error, attempt, budget, delay);
                        self.stats.record_retry();
                        self.queue.retry_later(task, delay);
                    }
                    Ok(RetryDecision::Quarantine) => {
                        error!("🚫 {} quarantined after {} retries: {}", task.url, task.retry_count, stage_error);
                        self.stats.record_quarantine();
                        self.archive_task(&task).await;
                        self.queue.finish(task);
                    }
                    Err(e) => {
                        error!("{}", e);
                        self.queue.finish(task);
                    }
                }
            }
        }
    }

    async fn archive_task(&self, task: &CrawlTask) {
        if let Err(e) = self.archive.archive(task).await {
            warn!("Failed to archive task {}: {}", task.url, e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::BackoffConfig;

    #[test]
    fn test_failure_classification() {
        let config = PipelineConfig {
            retry_budget: 3,
            extraction_retry_budget: Some(1),
            backoff: BackoffConfig::default(),
            ..PipelineConfig::default()
        };

        let navigation = StageError::Session(SessionError::Navigation {
            url: "https://shop.example".into(),
            reason: "reset".into(),
        });
        assert_eq!(navigation.retry_budget(&config), Some(3));
        assert_eq!(
            StageError::Session(SessionError::SessionExhausted { waited_ms: 10 }).retry_budget(&config),
            Some(3)
        );
        assert_eq!(
            StageError::Extraction(ExtractionError::missing_field("name", "u", vec![])).retry_budget(&config),
            Some(1)
        );
        assert_eq!(StageError::Timeout { timeout_ms: 5 }.retry_budget(&config), Some(3));
        assert_eq!(
            StageError::Normalization(NormalizationError::UnknownCurrency { raw: "12".into() }).retry_budget(&config),
            None
        );
        assert_eq!(StageError::NoRuleset { host: "x".into() }.retry_budget(&config), None);
        assert_eq!(StageError::Panicked { message: "boom".into() }.retry_budget(&config), None);
        assert_eq!(StageError::Session(SessionError::PoolClosed).retry_budget(&config), None);
    }

    #[test]
    fn test_panic_message_reads_str_and_string_payloads() {
        let from_str: Box<dyn Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(from_str.as_ref()), "index out of bounds");
        let from_string: Box<dyn Any + Send> = Box::new(format!("bad sku {}", 7));
        assert_eq!(panic_message(from_string.as_ref()), "bad sku 7");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
