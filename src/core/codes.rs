//! Stock code normalization and vendor format conversion.
//!
//! Providers disagree on code shapes: bare six-digit (`600000`), exchange
//! prefix (`SH600000`, `sh600000`), quote-server secid (`1.600000`), and
//! suffix forms (`600000.SH`). Everything funnels through [`normalize`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stock exchange identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Sh,
    Sz,
    Bj,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Sh => "sh",
            Exchange::Sz => "sz",
            Exchange::Bj => "bj",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Exchange::Sh => "Shanghai Stock Exchange",
            Exchange::Sz => "Shenzhen Stock Exchange",
            Exchange::Bj => "Beijing Stock Exchange",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SH_PREFIXES: [&str; 8] = ["60", "68", "50", "51", "52", "58", "11", "13"];
const SZ_PREFIXES: [&str; 7] = ["00", "30", "12", "15", "16", "18", "20"];
const BJ_PREFIXES: [&str; 2] = ["4", "8"];

const EXCHANGE_AFFIXES: [&str; 5] = ["SH", "SZ", "BJ", "HK", "US"];

/// Normalize any vendor code shape to the bare six-digit form.
///
/// Short numeric codes are left-padded with zeros. Unknown garbage passes
/// through stripped, so `is_valid` stays the authority on validity.
pub fn normalize(code: &str) -> String {
    let mut code = code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return code;
    }

    for prefix in EXCHANGE_AFFIXES {
        if code.starts_with(prefix) {
            code = code[prefix.len()..].to_string();
            break;
        }
    }

    // Quote-server secid form: a single market digit before a dot.
    let bytes = code.as_bytes();
    if bytes.len() > 2 && bytes[0].is_ascii_digit() && bytes[1] == b'.' {
        code = code[2..].to_string();
    }

    for suffix in EXCHANGE_AFFIXES {
        let dotted = format!(".{suffix}");
        if code.ends_with(&dotted) {
            code.truncate(code.len() - dotted.len());
            break;
        }
    }

    if code.len() < 6 && code.chars().all(|c| c.is_ascii_digit()) && !code.is_empty() {
        code = format!("{code:0>6}");
    }

    code
}

/// Determine the exchange from a code's numeric prefix.
pub fn exchange_of(code: &str) -> Option<Exchange> {
    let normalized = normalize(code);
    if normalized.len() != 6 || !normalized.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    if SH_PREFIXES.iter().any(|p| normalized.starts_with(p)) {
        Some(Exchange::Sh)
    } else if SZ_PREFIXES.iter().any(|p| normalized.starts_with(p)) {
        Some(Exchange::Sz)
    } else if BJ_PREFIXES.iter().any(|p| normalized.starts_with(p)) {
        Some(Exchange::Bj)
    } else {
        None
    }
}

/// Quote-server secid format: `1.600000` for Shanghai, `0.000001` for
/// Shenzhen and Beijing. Unknown exchanges default to the Shanghai market
/// digit, matching upstream behavior.
pub fn to_eastmoney_format(code: &str) -> String {
    let normalized = normalize(code);
    match exchange_of(&normalized) {
        Some(Exchange::Sh) | None => format!("1.{normalized}"),
        Some(Exchange::Sz) | Some(Exchange::Bj) => format!("0.{normalized}"),
    }
}

/// Suffix format shared by several vendors: `600000.SH`.
pub fn to_suffix_format(code: &str) -> String {
    let normalized = normalize(code);
    match exchange_of(&normalized) {
        Some(exchange) => format!("{normalized}.{}", exchange.as_str().to_ascii_uppercase()),
        None => normalized,
    }
}

/// Sina style: lowercase exchange prefix, `sh600000`.
pub fn to_sina_format(code: &str) -> String {
    let normalized = normalize(code);
    match exchange_of(&normalized) {
        Some(exchange) => format!("{}{normalized}", exchange.as_str()),
        None => normalized,
    }
}

/// Market digit used in quote-server query params ("1" SH, "0" SZ).
pub fn market_code(code: &str) -> &'static str {
    match exchange_of(code) {
        Some(Exchange::Sz) | Some(Exchange::Bj) => "0",
        _ => "1",
    }
}

pub fn is_valid(code: &str) -> bool {
    let normalized = normalize(code);
    normalized.len() == 6
        && normalized.chars().all(|c| c.is_ascii_digit())
        && exchange_of(&normalized).is_some()
}

/// Validate and explain: `(valid, reason)`.
pub fn validate(code: &str) -> (bool, String) {
    if code.trim().is_empty() {
        return (false, "code cannot be empty".to_string());
    }

    let normalized = normalize(code);
    if normalized.len() != 6 {
        return (
            false,
            format!("invalid code length: {}", normalized.len()),
        );
    }
    if !normalized.chars().all(|c| c.is_ascii_digit()) {
        return (false, "code must contain only digits".to_string());
    }
    match exchange_of(&normalized) {
        Some(exchange) => (true, format!("valid {} code", exchange.display_name())),
        None => (false, format!("unknown exchange for code: {normalized}")),
    }
}

/// Display form with optional name: `600000.SH Bank A`.
pub fn format_display(code: &str, name: Option<&str>) -> String {
    let base = to_suffix_format(code);
    match name {
        Some(name) => format!("{base} {name}"),
        None => base,
    }
}
