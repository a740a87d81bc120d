//! Configuration infrastructure
//!
//! Settings are layered with the `config` crate:
//! 1. Built-in defaults (the `defaults` module below)
//! 2. An optional config file (TOML / JSON / YAML, by extension)
//! 3. Environment variables, e.g. `CATALOG_PIPELINE__WORKER_COUNT=8`

#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::ruleset::{AvailabilityKeywords, Ruleset};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub browser: BrowserConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    /// Global availability keyword table, overridable per ruleset
    pub availability: AvailabilityKeywords,
    pub rulesets: Vec<Ruleset>,
}

/// Worker pool, retry and pacing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent workers
    pub worker_count: usize,

    /// Retries granted to a task before quarantine
    pub retry_budget: u32,

    /// Tighter budget for extraction failures; `None` uses `retry_budget`
    pub extraction_retry_budget: Option<u32>,

    /// Minimum spacing between requests to the same host
    pub per_host_rate_limit_ms: u64,

    pub navigation_timeout_ms: u64,

    /// How long a worker waits for a free browser session
    pub session_acquire_timeout_ms: u64,

    /// Hard timeout for one attempt of the whole per-task pipeline
    pub task_timeout_ms: u64,

    pub backoff: BackoffConfig,

    pub stats_interval_seconds: u64,

    /// Re-seeding a quarantined URL puts it back in the queue
    pub allow_quarantine_reseed: bool,

    /// Soft-expire catalog entries not seen by a completed run
    pub expire_unseen: bool,
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter, in [0, 1]
    pub jitter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Headless Chromium through the DevTools protocol
    Chromium,
    /// Plain HTTP fetch, for server-rendered pages
    Http,
}

/// Browser session pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub driver: DriverKind,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub max_sessions: usize,
    pub session_ttl_seconds: u64,
    /// Explicit browser executable; auto-detected when absent
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// JSON formatted file output
    pub json_format: bool,

    pub console_output: bool,

    pub file_output: bool,

    /// Log directory; defaults to `<data dir>/logs`
    pub directory: Option<PathBuf>,

    pub file_name: String,

    /// Fixed UTC offset used for timestamps
    pub utc_offset_hours: i32,

    /// Module-specific level filters (e.g., "sqlx": "warn")
    pub module_filters: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::WORKER_COUNT,
            retry_budget: defaults::RETRY_BUDGET,
            extraction_retry_budget: None,
            per_host_rate_limit_ms: defaults::PER_HOST_RATE_LIMIT_MS,
            navigation_timeout_ms: defaults::NAVIGATION_TIMEOUT_MS,
            session_acquire_timeout_ms: defaults::SESSION_ACQUIRE_TIMEOUT_MS,
            task_timeout_ms: defaults::TASK_TIMEOUT_MS,
            backoff: BackoffConfig::default(),
            stats_interval_seconds: defaults::STATS_INTERVAL_SECONDS,
            allow_quarantine_reseed: false,
            expire_unseen: false,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: defaults::BACKOFF_BASE_MS,
            max_ms: defaults::BACKOFF_MAX_MS,
            multiplier: defaults::BACKOFF_MULTIPLIER,
            jitter: defaults::BACKOFF_JITTER,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Chromium,
            headless: true,
            user_agent: Some(defaults::USER_AGENT.to_string()),
            proxy: None,
            max_sessions: defaults::MAX_SESSIONS,
            session_ttl_seconds: defaults::SESSION_TTL_SECONDS,
            executable: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = AppConfig::data_dir().join(defaults::DATABASE_FILE);
        Self {
            url: format!("sqlite:{}", path.display()),
            max_connections: defaults::DB_MAX_CONNECTIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            directory: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            utc_offset_hours: 0,
            module_filters: {
                let mut filters = BTreeMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("chromiumoxide".to_string(), "warn".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl PipelineConfig {
    pub const fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub const fn session_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.session_acquire_timeout_ms)
    }

    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub const fn per_host_spacing(&self) -> Duration {
        Duration::from_millis(self.per_host_rate_limit_ms)
    }

    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }

    pub fn effective_extraction_budget(&self) -> u32 {
        self.extraction_retry_budget
            .map_or(self.retry_budget, |b| b.min(self.retry_budget))
    }
}

impl BrowserConfig {
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }
}

impl LoggingConfig {
    pub fn log_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| AppConfig::data_dir().join("logs"))
    }
}

impl AppConfig {
    /// Application data directory (database, logs, exports)
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(defaults::APP_DIR_NAME)
    }

    /// Load defaults, then `path` (if given), then `CATALOG_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_layered(path, Self::environment())
    }

    /// `CATALOG_<SECTION>__<KEY>`: one underscore after the prefix, two between levels
    fn environment() -> config::Environment {
        config::Environment::with_prefix(defaults::ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_layered(path: Option<&Path>, environment: config::Environment) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder.add_source(environment).build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        info!(
            "Loaded configuration: {} rulesets, {} workers",
            config.rulesets.len(),
            config.pipeline.worker_count
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;
        if pipeline.worker_count == 0 {
            return Err(ConfigError::validation("pipeline.worker_count must be greater than 0"));
        }
        if pipeline.navigation_timeout_ms == 0
            || pipeline.task_timeout_ms == 0
            || pipeline.session_acquire_timeout_ms == 0
        {
            return Err(ConfigError::validation("pipeline timeouts must be greater than 0"));
        }
        if pipeline.backoff.base_ms > pipeline.backoff.max_ms {
            return Err(ConfigError::validation("backoff.base_ms cannot be greater than backoff.max_ms"));
        }
        if pipeline.backoff.multiplier < 1.0 {
            return Err(ConfigError::validation("backoff.multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&pipeline.backoff.jitter) {
            return Err(ConfigError::validation("backoff.jitter must be within [0, 1]"));
        }
        if self.browser.max_sessions == 0 {
            return Err(ConfigError::validation("browser.max_sessions must be greater than 0"));
        }

        let mut sources = HashSet::new();
        for ruleset in &self.rulesets {
            ruleset.validate().map_err(ConfigError::validation)?;
            if ruleset.hosts.is_empty() {
                return Err(ConfigError::validation(format!(
                    "ruleset '{}' lists no hosts and would never match a URL",
                    ruleset.source
                )));
            }
            if !sources.insert(ruleset.source.as_str()) {
                return Err(ConfigError::validation(format!(
                    "duplicate ruleset source '{}'",
                    ruleset.source
                )));
            }
        }
        Ok(())
    }

    pub fn ruleset_for_source(&self, source: &str) -> Option<&Ruleset> {
        self.rulesets.iter().find(|r| r.source == source)
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "catalog-crawler";

    /// Environment variable prefix (`CATALOG_PIPELINE__WORKER_COUNT`)
    pub const ENV_PREFIX: &str = "CATALOG";

    pub const WORKER_COUNT: usize = 4;
    pub const RETRY_BUDGET: u32 = 3;
    pub const PER_HOST_RATE_LIMIT_MS: u64 = 1000;
    pub const NAVIGATION_TIMEOUT_MS: u64 = 30_000;
    pub const SESSION_ACQUIRE_TIMEOUT_MS: u64 = 60_000;
    pub const TASK_TIMEOUT_MS: u64 = 120_000;

    pub const BACKOFF_BASE_MS: u64 = 1000;
    pub const BACKOFF_MAX_MS: u64 = 60_000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const BACKOFF_JITTER: f64 = 0.1;

    pub const STATS_INTERVAL_SECONDS: u64 = 30;

    pub const MAX_SESSIONS: usize = 2;
    pub const SESSION_TTL_SECONDS: u64 = 600;
    pub const USER_AGENT: &str =
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

    pub const DATABASE_FILE: &str = "catalog.db";
    pub const DB_MAX_CONNECTIONS: u32 = 5;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "catalog-crawler.log";
}
