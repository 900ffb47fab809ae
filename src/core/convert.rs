//! Safe value coercion for raw source fields.
//!
//! Upstream feeds mix numbers, numeric strings, placeholder dashes and empty
//! strings freely. Every converter here is total: bad input yields the
//! caller's default, never an error.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Date formats tried in order before falling back to RFC 3339.
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];
const DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%z",
];

/// Strip separators and detect the absent markers (`""`, `"-"`, `"--"`).
fn clean_numeric(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '%')
        .collect();
    if cleaned.is_empty() || cleaned == "-" || cleaned == "--" {
        None
    } else {
        Some(cleaned)
    }
}

pub fn to_float(value: &Value, default: Option<f64>) -> Option<f64> {
    match value {
        Value::Null => default,
        Value::Number(n) => n.as_f64().or(default),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match clean_numeric(s) {
            Some(cleaned) => cleaned.parse::<f64>().ok().or(default),
            None => default,
        },
        _ => default,
    }
}

pub fn to_float_rounded(value: &Value, default: Option<f64>, precision: u32) -> Option<f64> {
    to_float(value, default).map(|f| {
        let factor = 10f64.powi(precision as i32);
        (f * factor).round() / factor
    })
}

pub fn to_int(value: &Value, default: Option<i64>) -> Option<i64> {
    match value {
        Value::Null => default,
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .or(default),
        Value::Bool(b) => Some(*b as i64),
        Value::String(s) => match clean_numeric(s) {
            Some(cleaned) => {
                if cleaned.contains('.') {
                    cleaned.parse::<f64>().ok().map(|f| f as i64).or(default)
                } else {
                    cleaned.parse::<i64>().ok().or(default)
                }
            }
            None => default,
        },
        _ => default,
    }
}

pub fn to_str(value: &Value, default: Option<&str>) -> Option<String> {
    let rendered = match value {
        Value::Null => return default.map(str::to_string),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // Composite values are kept verbatim for raw passthrough fields.
        other => other.to_string(),
    };

    if rendered.is_empty() {
        default.map(str::to_string)
    } else {
        Some(rendered)
    }
}

pub fn to_decimal(value: &Value, default: Option<Decimal>) -> Option<Decimal> {
    match value {
        Value::Null => default,
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok().or(default),
        Value::String(s) => match clean_numeric(s) {
            Some(cleaned) => Decimal::from_str(&cleaned).ok().or(default),
            None => default,
        },
        _ => default,
    }
}

pub fn to_bool(value: &Value, default: Option<bool>) -> Option<bool> {
    match value {
        Value::Null => default,
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => default,
        },
        _ => default,
    }
}

pub fn to_date(value: &Value, default: Option<NaiveDate>) -> Option<NaiveDate> {
    let raw = match value {
        Value::String(s) => s.trim(),
        _ => return default,
    };
    if raw.is_empty() {
        return default;
    }

    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    if let Some(dt) = parse_datetime(raw) {
        return Some(dt.date());
    }
    default
}

pub fn to_datetime(value: &Value, default: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
    let raw = match value {
        Value::String(s) => s.trim(),
        _ => return default,
    };
    if raw.is_empty() {
        return default;
    }

    if let Some(dt) = parse_datetime(raw) {
        return Some(dt);
    }
    // A bare date becomes midnight.
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    default
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.naive_utc());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.naive_utc())
}

/// Convert a percentage or ratio into a decimal fraction.
///
/// A string carrying `%` is always divided by 100. A bare number with
/// magnitude above one is treated as a percentage when `is_percentage` is
/// set; values already in `[-1, 1]` pass through unchanged.
pub fn to_percent(value: &Value, default: Option<f64>, is_percentage: bool) -> Option<f64> {
    match value {
        Value::Null => default,
        Value::Number(n) => {
            let f = n.as_f64()?;
            if is_percentage && f.abs() > 1.0 {
                Some(f / 100.0)
            } else {
                Some(f)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return default;
            }
            let has_pct = trimmed.contains('%');
            let cleaned = clean_numeric(trimmed)?;
            match cleaned.parse::<f64>() {
                Ok(f) if has_pct => Some(f / 100.0),
                Ok(f) => Some(f),
                Err(_) => default,
            }
        }
        _ => default,
    }
}

/// Render a decimal fraction back as a percentage string, e.g. `0.055` →
/// `"5.50%"`.
pub fn percent_to_string(value: f64, precision: usize) -> String {
    format!("{:.*}%", precision, value * 100.0)
}
