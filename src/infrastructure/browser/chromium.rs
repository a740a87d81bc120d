//! Headless Chromium driver (chromiumoxide)
//!
//! Every session is its own browser process with a single tab. The CDP
//! handler loop runs on a spawned task for the lifetime of the session.

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::{BrowserDriver, BrowserSession, PageSnapshot, SessionError};
use crate::infrastructure::config::BrowserConfig;

pub struct ChromiumDriver {
    config: BrowserConfig,
}

impl ChromiumDriver {
    pub const fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn cdp_config(&self) -> Result<CdpConfig, SessionError> {
        let mut builder = CdpConfig::builder();
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = &self.config.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        if let Some(executable) = &self.config.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(SessionError::Launch)
    }
}

struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn load(&mut self, url: &Url) -> Result<PageSnapshot, SessionError> {
        self.page
            .goto(url.as_str())
            .await
            .map_err(|e| SessionError::navigation(url, e))?;

        let final_url = self
            .page
            .url()
            .await
            .map_err(|e| SessionError::navigation(url, e))?
            .and_then(|u| Url::parse(&u).ok())
            .unwrap_or_else(|| url.clone());

        let html = self
            .page
            .content()
            .await
            .map_err(|e| SessionError::navigation(url, e))?;

        debug!("Rendered {} ({} bytes)", final_url, html.len());
        Ok(PageSnapshot::new(url.clone(), final_url, html))
    }

    async fn close(self: Box<Self>) {
        let ChromiumSession {
            mut browser,
            page,
            handler,
        } = *self;
        if let Err(e) = page.close().await {
            debug!("Page close failed: {}", e);
        }
        if let Err(e) = browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        handler.abort();
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let (browser, mut handler) = Browser::launch(self.cdp_config()?)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(SessionError::Launch(e.to_string()));
            }
        };

        if let Some(user_agent) = &self.config.user_agent {
            page.set_user_agent(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(|e| SessionError::Launch(e.to_string()))?;
        }

        Ok(Box::new(ChromiumSession { browser, page, handler }))
    }

    fn name(&self) -> &'static str {
        "chromium"
    }
}
