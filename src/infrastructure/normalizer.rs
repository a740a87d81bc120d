//! Raw record to canonical product
//!
//! Required fields (name, price) fail normalization when they cannot be
//! coerced. Optional fields that fail are dropped with a warning so that one
//! odd review counter does not cost the whole product.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::domain::product::{Availability, CanonicalProduct, NaturalKey, ProductRecord, RawValue};
use crate::domain::ruleset::{AvailabilityKeywords, Ruleset, fields};

pub mod price;
pub mod text;

use text::{clean_optional, clean_spec_value, clean_text};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("Field '{field}' is missing or empty after cleanup")]
    MissingField { field: String },

    #[error("Cannot parse price '{raw}': {reason}")]
    InvalidPrice { raw: String, reason: String },

    #[error("Cannot determine currency for '{raw}'")]
    UnknownCurrency { raw: String },

    #[error("Invalid product URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl NormalizationError {
    fn missing(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }
}

/// Fields with dedicated handling; everything else becomes an attribute
const RESERVED: [&str; 9] = [
    fields::NAME,
    fields::PRICE,
    fields::SKU,
    fields::AVAILABILITY,
    fields::IMAGES,
    fields::DISCOUNT_PRICE,
    fields::VENDOR,
    fields::REVIEW_COUNT,
    fields::SPECIFICATIONS,
];

/// Normalizer bound to one source's ruleset
pub struct Normalizer {
    source: String,
    default_currency: Option<String>,
    keywords: Vec<(String, Availability)>,
}

impl Normalizer {
    /// The ruleset's own availability table wins over the global one
    pub fn new(ruleset: &Ruleset, global: &AvailabilityKeywords) -> Self {
        Self {
            source: ruleset.source.clone(),
            default_currency: ruleset.default_currency.clone(),
            keywords: ruleset.availability.as_ref().unwrap_or(global).ordered(),
        }
    }

    pub fn normalize(&self, raw: &ProductRecord) -> Result<CanonicalProduct, NormalizationError> {
        let url = canonical_url(raw.source_url())?;

        let name = clean_optional(raw.text(fields::NAME)).ok_or_else(|| NormalizationError::missing(fields::NAME))?;
        let price_text = raw
            .text(fields::PRICE)
            .ok_or_else(|| NormalizationError::missing(fields::PRICE))?;
        let price = price::parse_price(price_text, self.default_currency.as_deref())?;

        let sku = clean_optional(raw.text(fields::SKU)).unwrap_or_else(|| sku_from_url(&url));
        let key = NaturalKey::new(self.source.clone(), sku);

        let mut product = CanonicalProduct::new(key, name, price, url.to_string(), raw.extracted_at());

        product.discount_price = raw.text(fields::DISCOUNT_PRICE).and_then(|text| {
            price::parse_price(text, Some(product.price.currency.as_str()))
                .map_err(|e| warn!("Dropping discount price on {}: {}", url, e))
                .ok()
        });
        product.availability = raw
            .text(fields::AVAILABILITY)
            .map_or(Availability::Unknown, |text| self.map_availability(text));
        product.images = resolve_images(&url, &raw.list(fields::IMAGES));
        product.vendor = clean_optional(raw.text(fields::VENDOR));
        product.review_count = raw.text(fields::REVIEW_COUNT).and_then(|text| {
            let parsed = parse_count(text);
            if parsed.is_none() {
                warn!("Dropping review count '{}' on {}", text, url);
            }
            parsed
        });
        product.attributes = collect_attributes(raw);

        debug!("Normalized {} ({} attributes)", product.key, product.attributes.len());
        Ok(product.sealed())
    }

    /// Longest keyword contained in the cleaned text decides; no match is `Unknown`
    pub fn map_availability(&self, raw: &str) -> Availability {
        let text = clean_text(raw).to_lowercase();
        self.keywords
            .iter()
            .find(|(keyword, _)| text.contains(keyword.as_str()))
            .map_or(Availability::Unknown, |(_, status)| *status)
    }
}

/// One-shot form of `Normalizer::normalize`
pub fn normalize(
    raw: &ProductRecord,
    ruleset: &Ruleset,
    global: &AvailabilityKeywords,
) -> Result<CanonicalProduct, NormalizationError> {
    Normalizer::new(ruleset, global).normalize(raw)
}

fn canonical_url(raw: &str) -> Result<Url, NormalizationError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| NormalizationError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    url.set_fragment(None);
    Ok(url)
}

/// The URL path stands in for a SKU the page does not show
fn sku_from_url(url: &Url) -> String {
    let path = url.path().trim_matches('/');
    if path.is_empty() { "/".to_string() } else { path.to_string() }
}

fn resolve_images(base: &Url, raw: &[&str]) -> Vec<String> {
    let mut images: Vec<String> = Vec::with_capacity(raw.len());
    for candidate in raw {
        let candidate = clean_text(candidate);
        if candidate.is_empty() {
            continue;
        }
        match base.join(&candidate) {
            Ok(resolved) => {
                let resolved = resolved.to_string();
                if !images.contains(&resolved) {
                    images.push(resolved);
                }
            }
            Err(e) => debug!("Skipping image '{}': {}", candidate, e),
        }
    }
    images
}

/// First number in the text, grouping separators ignored: "(1 024 reviews)" is 1024
fn parse_count(raw: &str) -> Option<u32> {
    let text = clean_text(raw);
    let digits: String = price::first_number(&text)?.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn add_table(attributes: &mut BTreeMap<String, Option<String>>, rows: &BTreeMap<String, Option<String>>) {
    for (label, value) in rows {
        let label = clean_text(label);
        if !label.is_empty() {
            attributes.insert(label, value.as_deref().and_then(clean_spec_value));
        }
    }
}

fn collect_attributes(raw: &ProductRecord) -> BTreeMap<String, Option<String>> {
    let mut attributes = BTreeMap::new();
    if let Some(rows) = raw.table(fields::SPECIFICATIONS) {
        add_table(&mut attributes, rows);
    }
    for (name, value) in raw.fields().filter(|(name, _)| !RESERVED.contains(name)) {
        match value {
            RawValue::Table(rows) => add_table(&mut attributes, rows),
            RawValue::Text(text) => {
                attributes.insert(name.to_string(), clean_optional(Some(text.as_str())));
            }
            RawValue::List(items) => {
                let joined: Vec<String> = items.iter().map(|i| clean_text(i)).filter(|i| !i.is_empty()).collect();
                attributes.insert(name.to_string(), (!joined.is_empty()).then(|| joined.join(", ")));
            }
        }
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn record(fields: &[(&str, RawValue)]) -> ProductRecord {
        ProductRecord::new(
            "shop",
            "https://shop.example/p/widget#reviews",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            fields.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect(),
        )
    }

    fn text(value: &str) -> RawValue {
        RawValue::Text(value.to_string())
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(&Ruleset::new("shop").with_default_currency("USD"), &AvailabilityKeywords::default())
    }

    #[test]
    fn test_full_record() {
        let mut specs = BTreeMap::new();
        specs.insert("Screen ".to_string(), Some("6.1\u{a0}\", OLED,".to_string()));
        specs.insert("Weight".to_string(), None);
        let raw = record(&[
            ("name", text("  Widget\u{a0}Pro ")),
            ("price", text("$1,299.00")),
            ("discount_price", text("1 199")),
            ("sku", text(" W-1 ")),
            ("availability", text("In Stock!")),
            ("images", RawValue::List(vec!["/a.jpg".into(), "https://cdn.example/b.jpg".into(), "/a.jpg".into()])),
            ("vendor", text("Acme")),
            ("review_count", text("(1 024 reviews)")),
            ("specifications", RawValue::Table(specs)),
            ("color", text(" Red ")),
        ]);

        let product = normalizer().normalize(&raw).unwrap();
        assert_eq!(product.key, NaturalKey::new("shop", "W-1"));
        assert_eq!(product.name, "Widget Pro");
        assert_eq!(product.price.amount, Decimal::from_str("1299.00").unwrap());
        assert_eq!(product.price.currency, "USD");
        assert_eq!(product.discount_price.as_ref().unwrap().amount.to_string(), "1199.00");
        assert_eq!(product.availability, Availability::InStock);
        assert_eq!(product.images, vec!["https://shop.example/a.jpg", "https://cdn.example/b.jpg"]);
        assert_eq!(product.url, "https://shop.example/p/widget");
        assert_eq!(product.review_count, Some(1024));
        assert_eq!(product.attributes.get("Screen"), Some(&Some("6.1 \", OLED".to_string())));
        assert_eq!(product.attributes.get("Weight"), Some(&None));
        assert_eq!(product.attributes.get("color"), Some(&Some("Red".to_string())));
        assert_eq!(product.content_hash, product.compute_content_hash());
    }

    #[test]
    fn test_sku_falls_back_to_url_path() {
        let raw = record(&[("name", text("Widget")), ("price", text("$12"))]);
        let product = normalizer().normalize(&raw).unwrap();
        assert_eq!(product.key.sku, "p/widget");
        assert_eq!(product.availability, Availability::Unknown);
    }

    #[test]
    fn test_required_fields_fail_and_optional_fields_drop() {
        let blank_name = record(&[("name", text("  ")), ("price", text("$12"))]);
        assert_eq!(
            normalizer().normalize(&blank_name).unwrap_err(),
            NormalizationError::MissingField { field: "name".into() }
        );

        let bad_price = record(&[("name", text("Widget")), ("price", text("TBA"))]);
        assert!(matches!(
            normalizer().normalize(&bad_price),
            Err(NormalizationError::InvalidPrice { .. })
        ));

        let bad_optional = record(&[
            ("name", text("Widget")),
            ("price", text("$12")),
            ("discount_price", text("soon")),
            ("review_count", text("no reviews yet")),
        ]);
        let product = normalizer().normalize(&bad_optional).unwrap();
        assert_eq!(product.discount_price, None);
        assert_eq!(product.review_count, None);
    }

    #[test]
    fn test_negated_keyword_wins() {
        let normalizer = normalizer();
        assert_eq!(normalizer.map_availability("Not in stock"), Availability::OutOfStock);
        assert_eq!(normalizer.map_availability("Немає в наявності"), Availability::OutOfStock);
        assert_eq!(normalizer.map_availability("є в наявності"), Availability::InStock);
        assert_eq!(normalizer.map_availability("pre-order"), Availability::Unknown);
    }

    #[test]
    fn test_per_source_table_overrides_global() {
        let mut ruleset = Ruleset::new("shop");
        ruleset.availability = Some(AvailabilityKeywords {
            in_stock: vec!["ready".into()],
            out_of_stock: vec![],
        });
        let normalizer = Normalizer::new(&ruleset, &AvailabilityKeywords::default());
        assert_eq!(normalizer.map_availability("Ready to ship"), Availability::InStock);
        assert_eq!(normalizer.map_availability("in stock"), Availability::Unknown);
    }

    proptest! {
        #[test]
        fn prop_whitespace_does_not_change_output(pad in "[ \t\n\u{a0}]{0,4}", inner in "[ \u{a0}]{1,3}") {
            let plain = record(&[("name", text("Widget Pro")), ("price", text("$12"))]);
            let noisy = record(&[
                ("name", text(&format!("{pad}Widget{inner}Pro{pad}"))),
                ("price", text(&format!("{pad}$12{pad}"))),
            ]);
            let normalizer = normalizer();
            prop_assert_eq!(normalizer.normalize(&plain).unwrap(), normalizer.normalize(&noisy).unwrap());
        }

        #[test]
        fn prop_equivalent_availability_text_gives_identical_products(
            a in prop::sample::select(vec!["in stock", "In Stock", "  IN STOCK ", "In\u{a0}stock now"]),
            b in prop::sample::select(vec!["Available", "available today", "in stock", "Add to cart"]),
        ) {
            let build = |availability: &str| {
                record(&[("name", text("Widget")), ("price", text("$12")), ("availability", text(availability))])
            };
            let normalizer = normalizer();
            prop_assert_eq!(normalizer.normalize(&build(a)).unwrap(), normalizer.normalize(&build(b)).unwrap());
        }
    }
}
