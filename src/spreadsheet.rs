//! Row mapping for uploaded spreadsheets. The first three columns are fixed
//! (`email`, `name`, `phone`); any further column is folded into the person's
//! custom-fields map keyed by its header, with a best-effort scalar type.
use crate::model::{CustomFields, CustomValue, NewPerson};
use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use csv::StringRecord;
use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

pub fn is_valid_email(s: &str) -> bool {
    EMAIL_RE.is_match(s)
}

/// Map one data row to a person. Returns an error for malformed rows (bad
/// email, missing name); the caller drops and counts those without aborting
/// the file.
pub fn parse_row(headers: &StringRecord, record: &StringRecord) -> Result<NewPerson> {
    let email = record.get(0).unwrap_or("").trim();
    if !is_valid_email(email) {
        bail!("invalid email: {:?}", email);
    }
    let name = record.get(1).unwrap_or("").trim();
    if name.is_empty() {
        bail!("missing name for {}", email);
    }
    let phone = record
        .get(2)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let mut custom_fields = CustomFields::new();
    for (idx, raw) in record.iter().enumerate().skip(3) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let key = match headers.get(idx).map(str::trim) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => format!("column_{}", idx + 1),
        };
        custom_fields.insert(key, parse_custom_value(raw));
    }

    Ok(NewPerson {
        email: email.to_ascii_lowercase(),
        name: name.to_string(),
        phone,
        custom_fields,
    })
}

/// Type a raw cell as boolean, number, timestamp or plain text.
pub fn parse_custom_value(raw: &str) -> CustomValue {
    if raw.eq_ignore_ascii_case("true") {
        return CustomValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return CustomValue::Bool(false);
    }
    if let Ok(n) = raw.parse::<f64>() {
        if n.is_finite() {
            return CustomValue::Number(n);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return CustomValue::Timestamp(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return CustomValue::Timestamp(DateTime::from_naive_utc_and_offset(midnight, Utc));
        }
    }
    CustomValue::Text(raw.to_string())
}
