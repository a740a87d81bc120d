//! Data-driven extraction rules per source
//!
//! New sources are added through configuration, not code: a ruleset maps
//! each product field to an ordered list of selection strategies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::product::Availability;

/// Field names the normalizer understands. Anything else lands in attributes.
pub mod fields {
    pub const NAME: &str = "name";
    pub const PRICE: &str = "price";
    pub const SKU: &str = "sku";
    pub const AVAILABILITY: &str = "availability";
    pub const IMAGES: &str = "images";
    pub const DISCOUNT_PRICE: &str = "discount_price";
    pub const VENDOR: &str = "vendor";
    pub const REVIEW_COUNT: &str = "review_count";
    pub const SPECIFICATIONS: &str = "specifications";

    /// Fields whose absence fails extraction regardless of configuration
    pub const ALWAYS_REQUIRED: [&str; 2] = [NAME, PRICE];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    List,
    Table,
}

fn default_label_selector() -> String {
    "span".to_string()
}

/// How to locate a value on the page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Text content (or the named attribute) of elements matching `selector`
    Css {
        selector: String,
        #[serde(default)]
        attribute: Option<String>,
    },
    /// Text of the element following the one whose text contains `label`
    Label {
        label: String,
        #[serde(default = "default_label_selector")]
        label_selector: String,
    },
    /// Rows of label/value pairs
    Table { rows: String, label: String, value: String },
    /// First capture group of `pattern` applied to the page text
    Regex { pattern: String },
}

impl SelectionStrategy {
    pub fn describe(&self) -> String {
        match self {
            Self::Css { selector, attribute: Some(attr) } => format!("css:{selector}@{attr}"),
            Self::Css { selector, attribute: None } => format!("css:{selector}"),
            Self::Label { label, .. } => format!("label:{label}"),
            Self::Table { rows, .. } => format!("table:{rows}"),
            Self::Regex { pattern } => format!("regex:{pattern}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default)]
    pub kind: FieldKind,
    /// Tried in order; the first non-empty match wins
    pub select: Vec<SelectionStrategy>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl FieldRule {
    pub fn css(selector: &str) -> Self {
        Self {
            kind: FieldKind::Text,
            select: vec![SelectionStrategy::Css {
                selector: selector.to_string(),
                attribute: None,
            }],
            required: false,
            fallback: None,
        }
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: &str) -> Self {
        self.fallback = Some(fallback.to_string());
        self
    }

    #[must_use]
    pub fn or(mut self, strategy: SelectionStrategy) -> Self {
        self.select.push(strategy);
        self
    }
}

/// Keyword table mapping free availability text onto the fixed enum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityKeywords {
    #[serde(default)]
    pub in_stock: Vec<String>,
    #[serde(default)]
    pub out_of_stock: Vec<String>,
}

impl Default for AvailabilityKeywords {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| (*w).to_string()).collect();
        Self {
            in_stock: owned(&[
                "in stock",
                "available",
                "add to cart",
                "ships today",
                "в наявності",
                "є в наявності",
                "готовий до відправки",
            ]),
            out_of_stock: owned(&[
                "out of stock",
                "sold out",
                "unavailable",
                "not available",
                "not in stock",
                "немає в наявності",
                "закінчився",
            ]),
        }
    }
}

impl AvailabilityKeywords {
    /// Keywords paired with their status, longest first so that
    /// "not in stock" wins over "in stock".
    pub fn ordered(&self) -> Vec<(String, Availability)> {
        let mut pairs: Vec<(String, Availability)> = self
            .in_stock
            .iter()
            .map(|k| (k.to_lowercase(), Availability::InStock))
            .chain(
                self.out_of_stock
                    .iter()
                    .map(|k| (k.to_lowercase(), Availability::OutOfStock)),
            )
            .filter(|(k, _)| !k.trim().is_empty())
            .collect();
        pairs.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then_with(|| a.0.cmp(&b.0)));
        pairs
    }
}

fn default_max_results() -> usize {
    1
}

/// Search-page discovery for a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRule {
    /// URL with a `{query}` placeholder
    pub search_url_template: String,
    pub result_link_selector: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruleset {
    pub source: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    pub fields: BTreeMap<String, FieldRule>,
    /// Per-source keyword table; falls back to the global one when absent
    #[serde(default)]
    pub availability: Option<AvailabilityKeywords>,
    #[serde(default)]
    pub discovery: Option<DiscoveryRule>,
}

impl Ruleset {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            hosts: Vec::new(),
            default_currency: None,
            fields: BTreeMap::new(),
            availability: None,
            discovery: None,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: &str) -> Self {
        self.hosts.push(host.to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, rule: FieldRule) -> Self {
        self.fields.insert(name.to_string(), rule);
        self
    }

    #[must_use]
    pub fn with_default_currency(mut self, currency: &str) -> Self {
        self.default_currency = Some(currency.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.get(name)
    }

    /// Whether the field must be present for extraction to succeed
    pub fn is_required(&self, name: &str) -> bool {
        fields::ALWAYS_REQUIRED.contains(&name) || self.field(name).is_some_and(|r| r.required)
    }

    /// Exact host match or a subdomain of a listed host
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|h| {
            let h = h.to_ascii_lowercase();
            host == h || host.ends_with(&format!(".{h}"))
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("ruleset source must not be empty".to_string());
        }
        for required in fields::ALWAYS_REQUIRED {
            if !self.fields.contains_key(required) {
                return Err(format!("ruleset '{}' has no rule for '{required}'", self.source));
            }
        }
        for (name, rule) in &self.fields {
            if rule.select.is_empty() && rule.fallback.is_none() {
                return Err(format!(
                    "ruleset '{}' field '{name}' has neither strategies nor fallback",
                    self.source
                ));
            }
        }
        if let Some(discovery) = &self.discovery {
            if !discovery.search_url_template.contains("{query}") {
                return Err(format!(
                    "ruleset '{}' discovery template lacks a {{query}} placeholder",
                    self.source
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_fields() {
        let ruleset = Ruleset::new("shop")
            .with_field("name", FieldRule::css("h1"))
            .with_field("price", FieldRule::css(".price"))
            .with_field("sku", FieldRule { required: true, ..FieldRule::css(".sku") })
            .with_field("vendor", FieldRule::css(".vendor"));

        assert!(ruleset.is_required("name"));
        assert!(ruleset.is_required("price"));
        assert!(ruleset.is_required("sku"));
        assert!(!ruleset.is_required("vendor"));
        assert!(ruleset.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_price_rule() {
        let ruleset = Ruleset::new("shop").with_field("name", FieldRule::css("h1"));
        assert!(ruleset.validate().unwrap_err().contains("price"));
    }

    #[test]
    fn test_host_matching() {
        let ruleset = Ruleset::new("shop").with_host("shop.example");
        assert!(ruleset.matches_host("shop.example"));
        assert!(ruleset.matches_host("www.shop.example"));
        assert!(!ruleset.matches_host("othershop.example"));
    }

    #[test]
    fn test_keywords_ordered_longest_first() {
        let ordered = AvailabilityKeywords::default().ordered();
        let position = |kw: &str| ordered.iter().position(|(k, _)| k == kw).unwrap();
        assert!(position("not in stock") < position("in stock"));
        assert!(position("немає в наявності") < position("в наявності"));
    }

    #[test]
    fn test_strategy_deserializes_from_tagged_json() {
        let json = r#"{"select":[{"strategy":"css","selector":"img.main","attribute":"src"},
                                 {"strategy":"label","label":"Vendor"}],"kind":"list"}"#;
        let rule: FieldRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.kind, FieldKind::List);
        assert_eq!(rule.select.len(), 2);
        assert_eq!(
            rule.select[1],
            SelectionStrategy::Label {
                label: "Vendor".into(),
                label_selector: "span".into()
            }
        );
    }
}
