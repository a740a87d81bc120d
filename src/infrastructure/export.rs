//! CSV export of the catalog

use std::io::Write;

use thiserror::Error;

use crate::domain::product::CatalogEntry;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attribute serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub const HEADERS: [&str; 17] = [
    "source",
    "sku",
    "name",
    "price",
    "currency",
    "discount_price",
    "availability",
    "url",
    "vendor",
    "review_count",
    "images",
    "attributes",
    "revision",
    "first_seen",
    "last_seen",
    "last_updated",
    "expired_at",
];

/// Write `entries` with a header row; returns the number of data rows
pub fn write_csv<W: Write>(entries: &[CatalogEntry], output: W) -> Result<usize, ExportError> {
    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(HEADERS)?;

    for entry in entries {
        let row = to_row(entry)?;
        writer.write_record(row.iter().map(|cell| escape_csv_cell(cell)))?;
    }

    writer.flush()?;
    Ok(entries.len())
}

pub fn render_csv(entries: &[CatalogEntry]) -> Result<Vec<u8>, ExportError> {
    let mut buffer = Vec::new();
    write_csv(entries, &mut buffer)?;
    Ok(buffer)
}

fn to_row(entry: &CatalogEntry) -> Result<Vec<String>, ExportError> {
    let product = &entry.product;
    let optional = |value: Option<String>| value.unwrap_or_default();
    Ok(vec![
        product.key.source.clone(),
        product.key.sku.clone(),
        product.name.clone(),
        product.price.amount.to_string(),
        product.price.currency.clone(),
        optional(product.discount_price.as_ref().map(|m| m.amount.to_string())),
        product.availability.as_str().to_string(),
        product.url.clone(),
        optional(product.vendor.clone()),
        optional(product.review_count.map(|c| c.to_string())),
        product.images.join(" | "),
        serde_json::to_string(&product.attributes)?,
        entry.revision.to_string(),
        entry.first_seen.to_rfc3339(),
        product.last_seen.to_rfc3339(),
        entry.last_updated.to_rfc3339(),
        optional(entry.expired_at.map(|t| t.to_rfc3339())),
    ])
}

/// Spreadsheet apps evaluate cells starting with these characters as formulas
fn escape_csv_cell(value: &str) -> String {
    match value.chars().next() {
        Some('=' | '+' | '-' | '@') => format!("'{value}"),
        _ => value.to_string(),
    }
}
