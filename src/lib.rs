//! Catalog Crawler - browser-driven product data acquisition
//!
//! Pages are loaded through a bounded pool of browser sessions, fields are
//! pulled out with per-source rulesets, values are normalized into canonical
//! products and reconciled into a SQLite catalog without duplicates.

pub mod crawling;
pub mod domain;
pub mod infrastructure;

pub use crawling::{PipelineOrchestrator, RunSummary};
pub use infrastructure::config::AppConfig;
