//! # Seeding
//!
//! Turns operator input into queued crawl tasks: explicit URLs, a seed file
//! (one URL per line, `#` comments), or a search on the source's own site.

use std::path::Path;

use scraper::{Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::crawling::orchestrator::PipelineOrchestrator;
use crate::crawling::queues::SeedOutcome;
use crate::infrastructure::browser::SessionError;
use crate::infrastructure::catalog_repository::StoreError;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Unknown source '{0}'")]
    UnknownSource(String),

    #[error("Source '{0}' has no search discovery rule")]
    NoDiscovery(String),

    #[error("Invalid search result selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },

    #[error("Search URL '{url}' is invalid: {reason}")]
    SearchUrl { url: String, reason: String },

    #[error("Search page failed: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot read seed file: {0}")]
    Io(#[from] std::io::Error),
}

/// Tally of one seeding pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub enqueued: usize,
    pub already_queued: usize,
    pub refreshed: usize,
    pub skipped_quarantined: usize,
    /// Lines that are not absolute http(s) URLs
    pub rejected: Vec<String>,
}

impl SeedReport {
    fn record(&mut self, outcome: SeedOutcome) {
        match outcome {
            SeedOutcome::Enqueued => self.enqueued += 1,
            SeedOutcome::AlreadyQueued => self.already_queued += 1,
            SeedOutcome::Refreshed => self.refreshed += 1,
            SeedOutcome::SkippedQuarantined => self.skipped_quarantined += 1,
        }
    }

    pub const fn queued(&self) -> usize {
        self.enqueued + self.refreshed
    }
}

pub fn parse_seed_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url).filter(|u| u.host_str().is_some())
}

/// Seed lines: blank lines and `#` comments are skipped
pub fn parse_seed_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub async fn read_seed_file(path: &Path) -> Result<Vec<String>, SeedError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_seed_lines(&content))
}

pub async fn seed_urls<I, S>(orchestrator: &PipelineOrchestrator, urls: I) -> Result<SeedReport, SeedError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut report = SeedReport::default();
    for raw in urls {
        let raw = raw.as_ref();
        let Some(url) = parse_seed_url(raw) else {
            warn!("Rejecting seed '{}': not an absolute http(s) URL", raw);
            report.rejected.push(raw.to_string());
            continue;
        };
        report.record(orchestrator.enqueue(url).await?);
    }
    info!(
        "🌱 Seeded: {} new, {} refreshed, {} already queued, {} quarantined, {} rejected",
        report.enqueued,
        report.refreshed,
        report.already_queued,
        report.skipped_quarantined,
        report.rejected.len()
    );
    Ok(report)
}

/// Run the source's site search for `query` and return product page URLs
pub async fn discover(orchestrator: &PipelineOrchestrator, source: &str, query: &str) -> Result<Vec<Url>, SeedError> {
    let inner = &orchestrator.inner;
    let plan = inner
        .plan_for_source(source)
        .ok_or_else(|| SeedError::UnknownSource(source.to_string()))?;
    let rule = plan
        .ruleset
        .discovery
        .as_ref()
        .ok_or_else(|| SeedError::NoDiscovery(source.to_string()))?;

    let encoded: String = byte_serialize(query.trim().as_bytes()).collect();
    let raw_url = rule.search_url_template.replace("{query}", &encoded);
    let search_url = Url::parse(&raw_url).map_err(|e| SeedError::SearchUrl {
        url: raw_url.clone(),
        reason: e.to_string(),
    })?;
    let selector = Selector::parse(&rule.result_link_selector).map_err(|e| SeedError::Selector {
        selector: rule.result_link_selector.clone(),
        reason: e.to_string(),
    })?;

    let page = {
        let mut session = inner.pool.acquire(inner.config.session_acquire_timeout()).await?;
        if let Some(host) = search_url.host_str() {
            inner.limiter.until_ready(host).await;
        }
        session.navigate(&search_url, inner.config.navigation_timeout()).await?
    };

    let links = result_links(&page.html, &page.final_url, &selector, rule.max_results.max(1));
    info!("🔍 '{}' on {}: {} result(s)", query, source, links.len());
    Ok(links)
}

fn result_links(html: &str, base: &Url, selector: &Selector, limit: usize) -> Vec<Url> {
    let document = Html::parse_document(html);
    let mut links: Vec<Url> = Vec::new();
    for href in document.select(selector).filter_map(|el| el.value().attr("href")) {
        let Ok(mut url) = base.join(href.trim()) else {
            continue;
        };
        url.set_fragment(None);
        if !links.contains(&url) {
            links.push(url);
        }
        if links.len() >= limit {
            break;
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_seed_lines_skip_comments_and_blanks() {
        let content = "# phones\nhttps://shop.example/a\n\n   \n  https://shop.example/b  \n#https://shop.example/c\n";
        assert_eq!(parse_seed_lines(content), vec!["https://shop.example/a", "https://shop.example/b"]);
    }

    #[rstest]
    #[case("https://shop.example/a", true)]
    #[case("http://shop.example/a", true)]
    #[case("ftp://shop.example/a", false)]
    #[case("/relative/path", false)]
    #[case("not a url", false)]
    fn test_parse_seed_url(#[case] raw: &str, #[case] accepted: bool) {
        assert_eq!(parse_seed_url(raw).is_some(), accepted);
    }

    #[test]
    fn test_result_links_resolve_dedupe_and_cap() {
        let html = r##"
            <a class="hit" href="/p/1#top">One</a>
            <a class="hit" href="/p/1">One again</a>
            <a class="hit" href="https://cdn.shop.example/p/2">Two</a>
            <a class="hit">No href</a>
            <a class="hit" href="/p/3">Three</a>
        "##;
        let base = Url::parse("https://shop.example/search?q=x").unwrap();
        let selector = Selector::parse("a.hit").unwrap();

        let links = result_links(html, &base, &selector, 2);
        assert_eq!(
            links,
            vec![
                Url::parse("https://shop.example/p/1").unwrap(),
                Url::parse("https://cdn.shop.example/p/2").unwrap(),
            ]
        );
        assert_eq!(result_links(html, &base, &selector, 1).len(), 1);
    }
}
