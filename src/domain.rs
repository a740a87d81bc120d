//! Domain module - Core entities of the acquisition pipeline
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod crawl_task;
pub mod product;
pub mod ruleset;

pub use crawl_task::{CrawlTask, RetryDecision, TaskId, TaskStatus, TaskTransitionError};
pub use product::{
    Availability, CanonicalProduct, CatalogEntry, ChangeRecord, Money, NaturalKey, ProductRecord,
    RawValue, UpsertOutcome,
};
pub use ruleset::{
    AvailabilityKeywords, DiscoveryRule, FieldKind, FieldRule, Ruleset, SelectionStrategy,
};
