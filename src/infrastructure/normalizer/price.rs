//! Locale-tolerant price parsing
//!
//! Currency comes from an explicit ISO code, then a symbol, then the
//! ruleset's default. The number is read with these separator rules:
//! - spaces and apostrophes are grouping
//! - with both `.` and `,` present, the rightmost one is the decimal point
//! - a lone separator followed by exactly three digits is grouping
//!   (`$1,299` is 1299, `1.234` is 1234), unless the integer part is `0`

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;

use super::NormalizationError;
use super::text::clean_text;
use crate::domain::product::Money;

lazy_static! {
    /// Digits with any grouping/decimal separators between them
    static ref NUMBER: Regex = Regex::new(r"\d(?:[\d\s'’.,]*\d)?").expect("valid number pattern");
    static ref ISO_CODE: Regex = Regex::new(r"\b([A-Z]{3})\b").expect("valid currency code pattern");
}

const KNOWN_CODES: [&str; 16] = [
    "USD", "EUR", "GBP", "UAH", "JPY", "RUB", "PLN", "INR", "CAD", "AUD", "CHF", "CZK", "SEK", "NOK", "DKK", "CNY",
];

/// Checked in order; multi-character markers first
const SYMBOLS: [(&str, &str); 9] = [
    ("грн", "UAH"),
    ("zł", "PLN"),
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("₴", "UAH"),
    ("¥", "JPY"),
    ("₽", "RUB"),
    ("₹", "INR"),
];

pub const MIN_SCALE: u32 = 2;

/// The first run of digits and separators in `text`
pub fn first_number(text: &str) -> Option<&str> {
    NUMBER.find(text).map(|m| m.as_str())
}

pub fn detect_currency(text: &str, default_currency: Option<&str>) -> Option<String> {
    if let Some(code) = ISO_CODE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|code| KNOWN_CODES.contains(code))
    {
        return Some(code.to_string());
    }

    let lower = text.to_lowercase();
    SYMBOLS
        .iter()
        .find(|(symbol, _)| lower.contains(symbol))
        .map(|(_, code)| (*code).to_string())
        .or_else(|| default_currency.map(str::to_ascii_uppercase))
}

/// Parse the numeric part of `raw` into a decimal with at least two places
pub fn parse_amount(raw: &str) -> Result<Decimal, NormalizationError> {
    let text = clean_text(raw);
    let invalid = |reason: &str| NormalizationError::InvalidPrice {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    let number = first_number(&text).ok_or_else(|| invalid("no digits"))?;
    let compact: String = number
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '’')
        .collect();

    let canonical = match (compact.rfind('.'), compact.rfind(',')) {
        (Some(dot), Some(comma)) => {
            let (decimal, grouping) = if dot > comma { ('.', ',') } else { (',', '.') };
            compact.replace(grouping, "").replace(decimal, ".")
        }
        (Some(_), None) => resolve_single(&compact, '.'),
        (None, Some(_)) => resolve_single(&compact, ','),
        (None, None) => compact,
    };

    let mut amount = Decimal::from_str(&canonical).map_err(|e| invalid(&e.to_string()))?;
    if amount.scale() < MIN_SCALE {
        amount.rescale(MIN_SCALE);
    }
    Ok(amount)
}

fn resolve_single(compact: &str, separator: char) -> String {
    let occurrences = compact.matches(separator).count();
    let (integer, fraction) = compact.rsplit_once(separator).unwrap_or((compact, ""));
    let is_grouping = occurrences > 1 || (fraction.len() == 3 && integer != "0");
    if is_grouping {
        compact.replace(separator, "")
    } else {
        compact.replace(separator, ".")
    }
}

pub fn parse_price(raw: &str, default_currency: Option<&str>) -> Result<Money, NormalizationError> {
    let amount = parse_amount(raw)?;
    let currency = detect_currency(&clean_text(raw), default_currency).ok_or_else(|| {
        NormalizationError::UnknownCurrency { raw: raw.to_string() }
    })?;
    Ok(Money::new(amount, currency))
}
