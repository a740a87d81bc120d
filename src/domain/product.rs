//! Product entities flowing through the pipeline
//!
//! `ProductRecord` is what the extractor pulls off a page, `CanonicalProduct`
//! is what the normalizer hands to the reconciler, and `CatalogEntry` is the
//! persisted row owned by the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Stable identity of a product across crawls: source identifier + SKU
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub source: String,
    pub sku: String,
}

impl NaturalKey {
    pub fn new(source: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sku: sku.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.sku)
    }
}

/// Stock state of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OutOfStock,
    #[default]
    Unknown,
}

impl Availability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InStock => "in_stock",
            Self::OutOfStock => "out_of_stock",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Availability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_stock" => Ok(Self::InStock),
            "out_of_stock" => Ok(Self::OutOfStock),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("Invalid availability: {other}")),
        }
    }
}

/// Decimal amount with an ISO-4217 currency code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// A single raw value pulled off a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawValue {
    Text(String),
    List(Vec<String>),
    /// Label -> value pairs, e.g. a specification table. A label without a
    /// value cell maps to `None`.
    Table(BTreeMap<String, Option<String>>),
}

impl RawValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::List(items) => items.first().map(String::as_str),
            Self::Table(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Table(rows) => rows.is_empty(),
        }
    }
}

/// Raw extraction result for one page. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    source: String,
    source_url: String,
    extracted_at: DateTime<Utc>,
    fields: BTreeMap<String, RawValue>,
}

impl ProductRecord {
    pub fn new(
        source: impl Into<String>,
        source_url: impl Into<String>,
        extracted_at: DateTime<Utc>,
        fields: BTreeMap<String, RawValue>,
    ) -> Self {
        Self {
            source: source.into(),
            source_url: source_url.into(),
            extracted_at,
            fields,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub const fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    pub fn get(&self, field: &str) -> Option<&RawValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(RawValue::as_text)
    }

    pub fn list(&self, field: &str) -> Vec<&str> {
        match self.get(field) {
            Some(RawValue::List(items)) => items.iter().map(String::as_str).collect(),
            Some(RawValue::Text(text)) => vec![text.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn table(&self, field: &str) -> Option<&BTreeMap<String, Option<String>>> {
        match self.get(field) {
            Some(RawValue::Table(rows)) => Some(rows),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }
}

/// Normalized product ready for reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub key: NaturalKey,
    pub name: String,
    pub price: Money,
    pub discount_price: Option<Money>,
    pub availability: Availability,
    pub images: Vec<String>,
    pub url: String,
    pub vendor: Option<String>,
    pub review_count: Option<u32>,
    pub attributes: BTreeMap<String, Option<String>>,
    pub last_seen: DateTime<Utc>,
    pub content_hash: String,
}

/// Hash input view. `last_seen` is deliberately absent.
#[derive(Serialize)]
struct HashedFields<'a> {
    key: &'a NaturalKey,
    name: &'a str,
    price: (String, &'a str),
    discount_price: Option<(String, &'a str)>,
    availability: &'static str,
    images: &'a [String],
    url: &'a str,
    vendor: Option<&'a str>,
    review_count: Option<u32>,
    attributes: &'a BTreeMap<String, Option<String>>,
}

impl CanonicalProduct {
    /// Build a product with empty optional fields and a fresh content hash
    pub fn new(
        key: NaturalKey,
        name: impl Into<String>,
        price: Money,
        url: impl Into<String>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            price,
            discount_price: None,
            availability: Availability::Unknown,
            images: Vec::new(),
            url: url.into(),
            vendor: None,
            review_count: None,
            attributes: BTreeMap::new(),
            last_seen,
            content_hash: String::new(),
        }
        .sealed()
    }

    /// blake3 digest over every normalized field except `last_seen`
    pub fn compute_content_hash(&self) -> String {
        let view = HashedFields {
            key: &self.key,
            name: &self.name,
            price: (self.price.amount.to_string(), &self.price.currency),
            discount_price: self
                .discount_price
                .as_ref()
                .map(|m| (m.amount.to_string(), m.currency.as_str())),
            availability: self.availability.as_str(),
            images: &self.images,
            url: &self.url,
            vendor: self.vendor.as_deref(),
            review_count: self.review_count,
            attributes: &self.attributes,
        };
        // Serializing borrowed strings and maps into a Vec cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Recompute `content_hash` after field changes
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.content_hash = self.compute_content_hash();
        self
    }

    /// Names of normalized fields that differ from `other`
    pub fn changed_fields(&self, other: &Self) -> Vec<String> {
        let mut changed = Vec::new();
        let mut check = |name: &str, differs: bool| {
            if differs {
                changed.push(name.to_string());
            }
        };
        check("name", self.name != other.name);
        check("price", self.price != other.price);
        check("discount_price", self.discount_price != other.discount_price);
        check("availability", self.availability != other.availability);
        check("images", self.images != other.images);
        check("url", self.url != other.url);
        check("vendor", self.vendor != other.vendor);
        check("review_count", self.review_count != other.review_count);
        check("attributes", self.attributes != other.attributes);
        changed
    }
}

/// Persisted catalog row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub product: CanonicalProduct,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub revision: i64,
    pub expired_at: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    pub fn key(&self) -> &NaturalKey {
        &self.product.key
    }

    pub const fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }
}

/// Audit row written whenever an update changes content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: NaturalKey,
    pub revision: i64,
    pub changed_fields: Vec<String>,
    pub previous_hash: String,
    pub new_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Result of a reconciler upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { revision: i64 },
    Updated { revision: i64, changed_fields: Vec<String> },
    Unchanged { revision: i64 },
}

impl UpsertOutcome {
    pub const fn revision(&self) -> i64 {
        match self {
            Self::Created { revision } | Self::Updated { revision, .. } | Self::Unchanged { revision } => {
                *revision
            }
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Unchanged { .. } => "unchanged",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn widget(price: Decimal) -> CanonicalProduct {
        CanonicalProduct::new(
            NaturalKey::new("shop", "W-1"),
            "Widget",
            Money::new(price, "USD"),
            "https://shop.example/widget",
            Utc::now(),
        )
    }

    #[test]
    fn test_content_hash_ignores_last_seen() {
        let a = widget(Decimal::new(1200, 2));
        let mut b = a.clone();
        b.last_seen = a.last_seen + chrono::Duration::hours(5);
        assert_eq!(a.compute_content_hash(), b.compute_content_hash());
    }

    #[test]
    fn test_content_hash_tracks_field_changes() {
        let a = widget(Decimal::new(1200, 2));
        let b = widget(Decimal::new(1500, 2));
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a.changed_fields(&b), vec!["price".to_string()]);

        let mut c = a.clone();
        c.availability = Availability::InStock;
        let c = c.sealed();
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn test_availability_round_trips_through_str() {
        for availability in [Availability::InStock, Availability::OutOfStock, Availability::Unknown] {
            assert_eq!(availability.as_str().parse::<Availability>(), Ok(availability));
        }
        assert!("maybe".parse::<Availability>().is_err());
    }

    #[test]
    fn test_record_accessors() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), RawValue::Text("Widget".into()));
        fields.insert(
            "images".to_string(),
            RawValue::List(vec!["/a.jpg".into(), "/b.jpg".into()]),
        );
        let record = ProductRecord::new("shop", "https://shop.example/w", Utc::now(), fields);

        assert_eq!(record.text("name"), Some("Widget"));
        assert_eq!(record.list("images"), vec!["/a.jpg", "/b.jpg"]);
        assert!(record.table("images").is_none());
        assert!(!record.contains("sku"));
    }
}
