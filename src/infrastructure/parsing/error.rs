//! Extraction error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Required field '{field}' not found on {url}")]
    MissingField {
        field: String,
        url: String,
        tried: Vec<String>,
    },

    #[error("Invalid CSS selector in '{ruleset}.{field}': {selector} - {reason}")]
    InvalidSelector {
        ruleset: String,
        field: String,
        selector: String,
        reason: String,
    },

    #[error("Invalid pattern in '{ruleset}.{field}': {pattern} - {reason}")]
    InvalidPattern {
        ruleset: String,
        field: String,
        pattern: String,
        reason: String,
    },

    #[error("Ruleset '{ruleset}' is invalid: {reason}")]
    InvalidRuleset { ruleset: String, reason: String },
}

impl ExtractionError {
    pub fn missing_field(field: &str, url: &str, tried: Vec<String>) -> Self {
        Self::MissingField {
            field: field.to_string(),
            url: url.to_string(),
            tried,
        }
    }

    /// A missing field may be a half-rendered page; a broken ruleset will not fix itself.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingField { .. })
    }
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;
