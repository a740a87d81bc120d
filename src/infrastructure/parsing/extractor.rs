//! Applies a compiled ruleset to a page snapshot

use std::collections::BTreeMap;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use super::error::{ExtractionError, ExtractionResult};
use crate::domain::product::{ProductRecord, RawValue};
use crate::domain::ruleset::{FieldKind, FieldRule, Ruleset, SelectionStrategy};
use crate::infrastructure::browser::PageSnapshot;

enum CompiledStrategy {
    Css {
        selector: Selector,
        attribute: Option<String>,
    },
    Label {
        label: String,
        label_selector: Selector,
    },
    Table {
        rows: Selector,
        label: Selector,
        value: Selector,
    },
    Regex(Regex),
}

struct CompiledField {
    name: String,
    kind: FieldKind,
    required: bool,
    fallback: Option<String>,
    strategies: Vec<CompiledStrategy>,
    /// Human-readable strategy list for error reports
    described: Vec<String>,
}

/// A ruleset with every selector and pattern parsed
pub struct CompiledRuleset {
    source: String,
    fields: Vec<CompiledField>,
}

impl CompiledRuleset {
    pub fn compile(ruleset: &Ruleset) -> ExtractionResult<Self> {
        ruleset.validate().map_err(|reason| ExtractionError::InvalidRuleset {
            ruleset: ruleset.source.clone(),
            reason,
        })?;

        let fields = ruleset
            .fields
            .iter()
            .map(|(name, rule)| Self::compile_field(ruleset, name, rule))
            .collect::<ExtractionResult<Vec<_>>>()?;

        debug!("Compiled ruleset '{}' with {} fields", ruleset.source, fields.len());
        Ok(Self {
            source: ruleset.source.clone(),
            fields,
        })
    }

    /// Bad strategies are skipped with a warning; the field only fails to
    /// compile when nothing usable is left.
    fn compile_field(ruleset: &Ruleset, name: &str, rule: &FieldRule) -> ExtractionResult<CompiledField> {
        let mut strategies = Vec::new();
        let mut first_error = None;

        for strategy in &rule.select {
            let is_table = matches!(strategy, SelectionStrategy::Table { .. });
            if is_table != (rule.kind == FieldKind::Table) {
                return Err(ExtractionError::InvalidRuleset {
                    ruleset: ruleset.source.clone(),
                    reason: format!(
                        "field '{name}': strategy {} does not fit kind {:?}",
                        strategy.describe(),
                        rule.kind
                    ),
                });
            }

            match compile_strategy(ruleset, name, strategy) {
                Ok(compiled) => strategies.push(compiled),
                Err(e) => {
                    warn!("Skipping strategy {} for '{}.{}': {}", strategy.describe(), ruleset.source, name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if strategies.is_empty() && rule.fallback.is_none() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(CompiledField {
            name: name.to_string(),
            kind: rule.kind,
            required: ruleset.is_required(name),
            fallback: rule.fallback.clone(),
            strategies,
            described: rule.select.iter().map(SelectionStrategy::describe).collect(),
        })
    }

    /// Pull every configured field out of `page`
    pub fn extract(&self, page: &PageSnapshot) -> ExtractionResult<ProductRecord> {
        let document = Html::parse_document(&page.html);
        let page_text = page_text_of(&document);
        let url = page.final_url.as_str();
        let mut values = BTreeMap::new();

        for field in &self.fields {
            let found = field
                .strategies
                .iter()
                .map(|strategy| apply(strategy, field.kind, &document, &page_text))
                .find(|value| !value.is_empty());

            let value = found.or_else(|| {
                field.fallback.as_ref().map(|fallback| match field.kind {
                    FieldKind::List => RawValue::List(vec![fallback.clone()]),
                    _ => RawValue::Text(fallback.clone()),
                })
            });

            match value {
                Some(value) => {
                    values.insert(field.name.clone(), value);
                }
                None if field.required => {
                    return Err(ExtractionError::missing_field(&field.name, url, field.described.clone()));
                }
                None => debug!("Optional field '{}' absent on {}", field.name, url),
            }
        }

        Ok(ProductRecord::new(
            self.source.clone(),
            url,
            page.fetched_at,
            values,
        ))
    }
}

/// Compile `ruleset` and apply it once
pub fn extract(page: &PageSnapshot, ruleset: &Ruleset) -> ExtractionResult<ProductRecord> {
    CompiledRuleset::compile(ruleset)?.extract(page)
}

fn compile_strategy(ruleset: &Ruleset, field: &str, strategy: &SelectionStrategy) -> ExtractionResult<CompiledStrategy> {
    let selector = |raw: &str| {
        Selector::parse(raw).map_err(|e| ExtractionError::InvalidSelector {
            ruleset: ruleset.source.clone(),
            field: field.to_string(),
            selector: raw.to_string(),
            reason: e.to_string(),
        })
    };

    Ok(match strategy {
        SelectionStrategy::Css { selector: raw, attribute } => CompiledStrategy::Css {
            selector: selector(raw)?,
            attribute: attribute.clone(),
        },
        SelectionStrategy::Label { label, label_selector } => CompiledStrategy::Label {
            label: label.to_lowercase(),
            label_selector: selector(label_selector)?,
        },
        SelectionStrategy::Table { rows, label, value } => CompiledStrategy::Table {
            rows: selector(rows)?,
            label: selector(label)?,
            value: selector(value)?,
        },
        SelectionStrategy::Regex { pattern } => {
            CompiledStrategy::Regex(Regex::new(pattern).map_err(|e| ExtractionError::InvalidPattern {
                ruleset: ruleset.source.clone(),
                field: field.to_string(),
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?)
        }
    })
}

fn page_text_of(document: &Html) -> String {
    document.root_element().text().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn element_value(element: ElementRef<'_>, attribute: Option<&str>) -> Option<String> {
    let value = match attribute {
        Some(attr) => element.value().attr(attr).map(|v| v.trim().to_string())?,
        None => element_text(element),
    };
    (!value.is_empty()).then_some(value)
}

/// The first element sibling after `element`, skipping text nodes
fn next_element_sibling(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element.next_siblings().find_map(ElementRef::wrap)
}

fn into_raw(kind: FieldKind, mut values: Vec<String>) -> RawValue {
    match kind {
        FieldKind::List => RawValue::List(values),
        _ if values.is_empty() => RawValue::Text(String::new()),
        _ => RawValue::Text(values.swap_remove(0)),
    }
}

fn apply(strategy: &CompiledStrategy, kind: FieldKind, document: &Html, page_text: &str) -> RawValue {
    match strategy {
        CompiledStrategy::Css { selector, attribute } => {
            let values: Vec<String> = document
                .select(selector)
                .filter_map(|el| element_value(el, attribute.as_deref()))
                .collect();
            into_raw(kind, values)
        }
        CompiledStrategy::Label { label, label_selector } => {
            let values: Vec<String> = document
                .select(label_selector)
                .filter(|el| element_text(*el).to_lowercase().contains(label.as_str()))
                .filter_map(next_element_sibling)
                .map(element_text)
                .filter(|text| !text.is_empty())
                .collect();
            into_raw(kind, values)
        }
        CompiledStrategy::Table { rows, label, value } => {
            let mut table = BTreeMap::new();
            for row in document.select(rows) {
                let Some(row_label) = row.select(label).next().map(element_text) else {
                    continue;
                };
                if row_label.is_empty() {
                    continue;
                }
                let row_value = row
                    .select(value)
                    .map(element_text)
                    .find(|text| !text.is_empty() && *text != row_label);
                table.entry(row_label).or_insert(row_value);
            }
            RawValue::Table(table)
        }
        CompiledStrategy::Regex(pattern) => {
            let values: Vec<String> = pattern
                .captures_iter(page_text)
                .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().trim().to_string())
                .filter(|text| !text.is_empty())
                .collect();
            into_raw(kind, values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    const PAGE: &str = r#"
        <html><body>
          <h1 class="title"> Widget  Pro </h1>
          <div class="price"><span>1 299</span> грн</div>
          <div class="old-price"></div>
          <div class="info">
            <span>Vendor:</span><span>Acme</span>
            <span>Color:</span> <span>Red</span>
          </div>
          <img class="gallery" src="/img/1.jpg">
          <img class="gallery" src="/img/2.jpg">
          <img class="gallery">
          <div class="chr">
            <div><span>Screen</span><span>6.1&nbsp;", OLED</span></div>
            <div><span>Weight</span></div>
          </div>
          <p>Product code: AB-123</p>
        </body></html>
    "#;

    fn snapshot(html: &str) -> PageSnapshot {
        let url = Url::parse("https://shop.example/p/widget").unwrap();
        PageSnapshot::new(url.clone(), url, html.to_string())
    }

    fn ruleset() -> Ruleset {
        Ruleset::new("shop")
            .with_field("name", FieldRule::css("h1.title"))
            .with_field("price", FieldRule::css(".old-price").or(SelectionStrategy::Css {
                selector: ".price".into(),
                attribute: None,
            }))
            .with_field("vendor", FieldRule {
                select: vec![SelectionStrategy::Label {
                    label: "vendor".into(),
                    label_selector: "span".into(),
                }],
                ..FieldRule::css("unused")
            })
            .with_field("images", FieldRule {
                select: vec![SelectionStrategy::Css {
                    selector: "img.gallery".into(),
                    attribute: Some("src".into()),
                }],
                ..FieldRule::css("unused").with_kind(FieldKind::List)
            })
            .with_field("specifications", FieldRule {
                kind: FieldKind::Table,
                select: vec![SelectionStrategy::Table {
                    rows: "div.chr > div".into(),
                    label: "span:nth-child(1)".into(),
                    value: "span".into(),
                }],
                required: false,
                fallback: None,
            })
            .with_field("sku", FieldRule {
                select: vec![SelectionStrategy::Regex {
                    pattern: r"Product code:\s*([A-Z0-9-]+)".into(),
                }],
                ..FieldRule::css("unused")
            })
    }

    #[test]
    fn test_extracts_every_strategy() {
        let record = extract(&snapshot(PAGE), &ruleset()).unwrap();

        assert_eq!(record.source(), "shop");
        assert_eq!(record.text("name"), Some("Widget  Pro"));
        assert_eq!(record.text("price"), Some("1 299 грн"));
        assert_eq!(record.text("vendor"), Some("Acme"));
        assert_eq!(record.list("images"), vec!["/img/1.jpg", "/img/2.jpg"]);
        assert_eq!(record.text("sku"), Some("AB-123"));

        let specs = record.table("specifications").unwrap();
        assert_eq!(specs.get("Screen"), Some(&Some("6.1\u{a0}\", OLED".to_string())));
        assert_eq!(specs.get("Weight"), Some(&None));
    }

    #[test]
    fn test_missing_required_field_names_field_and_url() {
        let html = "<html><body><div class='price'>$12</div></body></html>";
        let err = extract(&snapshot(html), &ruleset()).unwrap_err();

        match err {
            ExtractionError::MissingField { field, url, tried } => {
                assert_eq!(field, "name");
                assert_eq!(url, "https://shop.example/p/widget");
                assert_eq!(tried, vec!["css:h1.title".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ExtractionError::missing_field("name", "u", vec![]).is_recoverable());
    }

    #[test]
    fn test_fallback_and_optional_absence() {
        let html = "<h1 class='title'>Widget</h1><div class='price'>$12</div>";
        let ruleset = ruleset().with_field("availability", FieldRule::css(".stock").with_fallback("in stock"));
        let record = extract(&snapshot(html), &ruleset).unwrap();

        assert_eq!(record.text("availability"), Some("in stock"));
        assert!(!record.contains("vendor"));
        assert!(!record.contains("specifications"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let page = snapshot(PAGE);
        let compiled = CompiledRuleset::compile(&ruleset()).unwrap();
        assert_eq!(compiled.extract(&page).unwrap(), compiled.extract(&page).unwrap());
    }

    #[test]
    fn test_bad_selector_is_skipped_when_another_compiles() {
        let rule = FieldRule::css("h1[").or(SelectionStrategy::Css {
            selector: "h1.title".into(),
            attribute: None,
        });
        let ruleset = ruleset().with_field("name", rule);
        let record = extract(&snapshot(PAGE), &ruleset).unwrap();
        assert_eq!(record.text("name"), Some("Widget  Pro"));
    }

    #[test]
    fn test_field_with_only_bad_selectors_fails_to_compile() {
        let ruleset = ruleset().with_field("name", FieldRule::css("h1["));
        let err = CompiledRuleset::compile(&ruleset).err().unwrap();
        assert!(matches!(err, ExtractionError::InvalidSelector { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_table_strategy_requires_table_kind() {
        let ruleset = ruleset().with_field("vendor", FieldRule {
            select: vec![SelectionStrategy::Table {
                rows: "tr".into(),
                label: "th".into(),
                value: "td".into(),
            }],
            ..FieldRule::css("unused")
        });
        assert!(matches!(
            CompiledRuleset::compile(&ruleset).err(),
            Some(ExtractionError::InvalidRuleset { .. })
        ));
    }
}
