//! Plain HTTP "browser" for pages that render on the server
//!
//! Each session owns its own `reqwest::Client` so cookies stay per-session,
//! the way separate browser profiles would.

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Proxy};
use tracing::debug;
use url::Url;

use super::{BrowserDriver, BrowserSession, PageSnapshot, SessionError};
use crate::infrastructure::config::BrowserConfig;

pub struct HttpDriver {
    config: BrowserConfig,
}

impl HttpDriver {
    pub fn new(config: BrowserConfig) -> Result<Self, SessionError> {
        // Fail fast on a malformed proxy instead of on the first launch.
        if let Some(proxy) = &config.proxy {
            Proxy::all(proxy.as_str()).map_err(|e| SessionError::Launch(format!("invalid proxy {proxy}: {e}")))?;
        }
        Ok(Self { config })
    }

    fn build_client(&self) -> Result<Client, SessionError> {
        let mut builder = ClientBuilder::new()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        if let Some(proxy) = &self.config.proxy {
            let proxy = Proxy::all(proxy.as_str()).map_err(|e| SessionError::Launch(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| SessionError::Launch(e.to_string()))
    }
}

struct HttpSession {
    client: Client,
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn load(&mut self, url: &Url) -> Result<PageSnapshot, SessionError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SessionError::navigation(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::navigation(url, format!("HTTP {status}")));
        }

        let final_url = response.url().clone();
        let html = response.text().await.map_err(|e| SessionError::navigation(url, e))?;
        debug!("Fetched {} ({} bytes)", final_url, html.len());
        Ok(PageSnapshot::new(url.clone(), final_url, html))
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl BrowserDriver for HttpDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        Ok(Box::new(HttpSession {
            client: self.build_client()?,
        }))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_proxy_is_rejected() {
        let config = BrowserConfig {
            proxy: Some("http://[invalid".into()),
            ..BrowserConfig::default()
        };
        assert!(matches!(HttpDriver::new(config), Err(SessionError::Launch(_))));
    }

    #[tokio::test]
    async fn test_launch_builds_session() {
        let driver = HttpDriver::new(BrowserConfig::default()).unwrap();
        assert!(driver.launch().await.is_ok());
        assert_eq!(driver.name(), "http");
    }
}
