//! Infrastructure layer: browser sessions, parsing, normalization,
//! persistence, export, configuration and logging.

pub mod browser;
pub mod catalog_repository;
pub mod config;
pub mod database_connection;
pub mod export;
pub mod logging;
pub mod normalizer;
pub mod parsing;

pub use browser::{BrowserDriver, BrowserSession, PageSnapshot, SessionError, SessionPool};
pub use catalog_repository::{CatalogStore, SqliteCatalogStore, StoreError, TaskArchive};
pub use database_connection::DatabaseConnection;
pub use logging::{init_logging, init_logging_with_config};
pub use normalizer::{NormalizationError, Normalizer};
pub use parsing::{CompiledRuleset, ExtractionError};
