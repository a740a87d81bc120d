//! Browser session management
//!
//! A `BrowserDriver` launches sessions; the `SessionPool` hands them out one
//! caller at a time and takes them back on every exit path. Drivers:
//! - `chromium`: headless Chromium over the DevTools protocol
//! - `http`: plain `reqwest` fetches for server-rendered pages
//! - `static_pages`: in-memory pages for tests and offline fixtures

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

use crate::infrastructure::config::{BrowserConfig, DriverKind};

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod http_driver;
pub mod session_pool;
pub mod static_pages;

pub use session_pool::{SessionHandle, SessionPool};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Navigation to {url} timed out after {timeout_ms} ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    #[error("No browser session available after waiting {waited_ms} ms")]
    SessionExhausted { waited_ms: u64 },

    #[error("Failed to launch browser session: {0}")]
    Launch(String),

    #[error("Session pool is shut down")]
    PoolClosed,
}

impl SessionError {
    pub fn navigation(url: &Url, reason: impl ToString) -> Self {
        Self::Navigation {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Network trouble, timeouts and pool pressure are transient
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::PoolClosed)
    }
}

/// Immutable snapshot of a loaded page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub requested_url: Url,
    /// URL after redirects
    pub final_url: Url,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

impl PageSnapshot {
    pub fn new(requested_url: Url, final_url: Url, html: String) -> Self {
        Self {
            requested_url,
            final_url,
            html,
            fetched_at: Utc::now(),
        }
    }
}

/// One live browser (or HTTP client) owned by a single caller at a time
#[async_trait]
pub trait BrowserSession: Send {
    async fn load(&mut self, url: &Url) -> Result<PageSnapshot, SessionError>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError>;

    fn name(&self) -> &'static str;
}

/// Build the driver selected in configuration
pub fn build_driver(config: &BrowserConfig) -> Result<Arc<dyn BrowserDriver>, SessionError> {
    match config.driver {
        #[cfg(feature = "chromium")]
        DriverKind::Chromium => Ok(Arc::new(chromium::ChromiumDriver::new(config.clone()))),
        #[cfg(not(feature = "chromium"))]
        DriverKind::Chromium => Err(SessionError::Launch(
            "built without the `chromium` feature; use driver = \"http\"".to_string(),
        )),
        DriverKind::Http => Ok(Arc::new(http_driver::HttpDriver::new(config.clone())?)),
    }
}
