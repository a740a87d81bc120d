//! In-memory page driver
//!
//! Serves HTML registered up front. Used by the test suite and for replaying
//! saved fixtures without network access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use super::{BrowserDriver, BrowserSession, PageSnapshot, SessionError};

#[derive(Default)]
struct StaticState {
    pages: RwLock<HashMap<String, String>>,
    /// Remaining forced navigation failures per URL
    failures: RwLock<HashMap<String, usize>>,
    delay: RwLock<Option<Duration>>,
    url_delays: RwLock<HashMap<String, Duration>>,
    launches: AtomicUsize,
    loads: AtomicUsize,
    /// URL and start time of every load, in order
    load_log: Mutex<Vec<(String, Instant)>>,
}

#[derive(Clone, Default)]
pub struct StaticPageDriver {
    state: Arc<StaticState>,
}

impl StaticPageDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the HTML served for `url`
    pub fn insert(&self, url: &str, html: &str) {
        self.state
            .pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), html.to_string());
    }

    /// Make the next `count` loads of `url` fail with a navigation error
    pub fn fail_next(&self, url: &str, count: usize) {
        self.state
            .failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), count);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.write().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Delay for `url` only; takes precedence over `set_delay`
    pub fn set_delay_for(&self, url: &str, delay: Duration) {
        self.state
            .url_delays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), delay);
    }

    pub fn load_log(&self) -> Vec<(String, Instant)> {
        self.state.load_log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }
}

struct StaticSession {
    state: Arc<StaticState>,
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn load(&mut self, url: &Url) -> Result<PageSnapshot, SessionError> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        self.state
            .load_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_string(), Instant::now()));
        let delay = self
            .state
            .url_delays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url.as_str())
            .copied()
            .or(*self.state.delay.read().unwrap_or_else(PoisonError::into_inner));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.state.failures.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = failures.get_mut(url.as_str()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SessionError::navigation(url, "connection reset"));
                }
            }
        }

        let html = self
            .state
            .pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url.as_str())
            .cloned();
        html.map(|html| PageSnapshot::new(url.clone(), url.clone(), html))
            .ok_or_else(|| SessionError::navigation(url, "HTTP 404"))
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl BrowserDriver for StaticPageDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticSession {
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
