//! Logging system configuration and initialization
//!
//! - Console output and/or a non-blocking file writer
//! - Optional JSON formatting for the file layer
//! - `RUST_LOG` overrides the configured filter
//! - Timestamps in a configurable fixed UTC offset

#![allow(clippy::uninlined_format_args)]

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{FixedOffset, Offset, Utc};
use lazy_static::lazy_static;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

// Keeps the file writer alive for the lifetime of the process
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Formats timestamps in a fixed offset from UTC
#[derive(Debug, Clone, Copy)]
struct OffsetTimeFormatter {
    offset: FixedOffset,
}

impl OffsetTimeFormatter {
    fn new(hours: i32) -> Self {
        let offset = FixedOffset::east_opt(hours.clamp(-23, 23) * 3600).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }
}

impl FormatTime for OffsetTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Utc::now().with_timezone(&self.offset);
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Build the env filter: `RUST_LOG` wins, otherwise the configured level
/// plus quieter per-module directives.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut filter = EnvFilter::new(&config.level);
    if !config.level.to_lowercase().contains("trace") {
        for (module, level) in &config.module_filters {
            match format!("{module}={level}").parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring invalid log directive {module}={level}: {e}"),
            }
        }
    }
    if let Ok(directive) = format!("catalog_crawler={}", config.level).parse() {
        filter = filter.add_directive(directive);
    }
    filter
}

/// Initialize logging with the default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging with custom configuration.
///
/// Returns an error when no output is configured or a global subscriber is
/// already installed.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let timer = OffsetTimeFormatter::new(config.utc_offset_hours);
    let registry = Registry::default().with(build_filter(config));

    let console_layer = config.console_output.then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_timer(timer)
            .with_target(false)
    });

    let log_dir = config.log_directory();
    let (file_layer, json_layer) = if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
        let (writer, guard) = non_blocking(rolling::never(&log_dir, &config.file_name));
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(guard);

        if config.json_format {
            let layer = fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false);
            (None, Some(layer))
        } else {
            let layer = fmt::Layer::new()
                .with_writer(writer)
                .with_timer(timer)
                .with_target(false)
                .with_ansi(false);
            (Some(layer), None)
        }
    } else {
        (None, None)
    };

    if console_layer.is_none() && file_layer.is_none() && json_layer.is_none() {
        return Err(anyhow!("No logging output configured"));
    }

    registry
        .with(console_layer)
        .with(file_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log file: {:?}", log_dir.join(&config.file_name));
    }
    Ok(())
}

/// Console-only logging for tests and tools; safe to call repeatedly
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== Catalog Crawler ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
}
