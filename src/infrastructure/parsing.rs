//! Rule-driven HTML extraction
//!
//! Rulesets are compiled once (selectors and patterns parsed up front) and
//! then applied to any number of page snapshots. Extraction is pure: the same
//! snapshot and ruleset always produce the same `ProductRecord`.

pub mod error;
pub mod extractor;

pub use error::{ExtractionError, ExtractionResult};
pub use extractor::{CompiledRuleset, extract};
