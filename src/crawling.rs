//! # Crawling
//!
//! The run-time half of the pipeline:
//! - `queues`: deduplicated task queue with delayed retries
//! - `rate_limiter`: per-host request spacing
//! - `retry_policy`: exponential backoff with jitter
//! - `reconciler`: idempotent catalog upserts
//! - `orchestrator`: worker pool tying the stages together
//! - `seeding`: URL lists, seed files and site search
//! - `state`: run counters and the final summary

pub mod orchestrator;
pub mod queues;
pub mod rate_limiter;
pub mod reconciler;
pub mod retry_policy;
pub mod seeding;
pub mod state;

pub use orchestrator::{OrchestratorError, PipelineOrchestrator, StageError};
pub use queues::{QueueCounts, SeedOutcome, TaskQueue};
pub use rate_limiter::HostRateLimiter;
pub use reconciler::Reconciler;
pub use retry_policy::BackoffPolicy;
pub use seeding::{SeedError, SeedReport, discover, read_seed_file, seed_urls};
pub use state::{RunStats, RunSummary, StatsSnapshot, UnfinishedUrl};
