//! Field normalisers. Every validator is total: absent or blank input gives
//! `None` silently, malformed input gives `None` plus one warning.

use std::sync::OnceLock;

use chrono::{Datelike, Utc};
use regex::Regex;

use crate::{cached, WarningSink};

fn present(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn without_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// First `local@domain.tld` found in the text.
pub fn email(raw: Option<&str>, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let value = present(raw)?;
    match cached(&RE, r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").find(value) {
        Some(m) => Some(m.as_str().to_string()),
        None => {
            sink.warn(&format!("No valid email found in: {value}"));
            None
        }
    }
}

/// First Czech 3-3-3 number in the text, normalised to `+420 XXX XXX XXX`.
pub fn phone(raw: Option<&str>, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let value = present(raw)?;
    match cached(&RE, r"(?:\+420\s*)?([0-9]{3})\s*([0-9]{3})\s*([0-9]{3})").captures(value) {
        Some(caps) => Some(format!("+420 {} {} {}", &caps[1], &caps[2], &caps[3])),
        None => {
            sink.warn(&format!("No valid phone number found in: {value}"));
            None
        }
    }
}

pub fn url(raw: Option<&str>, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let value = present(raw)?;
    let candidate = if value.starts_with("http://") || value.starts_with("https://") {
        value.to_string()
    } else {
        format!("http://{value}")
    };
    if cached(&RE, r"^https?://([\w\-]+\.)+[\w\-]+(/[\w\-._/]*)*/?$").is_match(&candidate) {
        Some(candidate)
    } else {
        sink.warn(&format!("Invalid URL format: {candidate}"));
        None
    }
}

/// IČ: company identification number, eight digits.
pub fn ic(raw: Option<&str>, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let value = without_whitespace(present(raw)?);
    if cached(&RE, r"^[0-9]{8}$").is_match(&value) {
        Some(value)
    } else {
        sink.warn(&format!("Invalid IČ format: {value}"));
        None
    }
}

/// DIČ: VAT number, `CZ` followed by 8 to 10 digits.
pub fn dic(raw: Option<&str>, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let value = without_whitespace(present(raw)?);
    if cached(&RE, r"^CZ[0-9]{8,10}$").is_match(&value) {
        Some(value)
    } else {
        sink.warn(&format!("Invalid DIČ format: {value}"));
        None
    }
}

pub fn data_box(raw: Option<&str>, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let value = without_whitespace(present(raw)?);
    if cached(&RE, r"^[a-zA-Z0-9]{7}$").is_match(&value) {
        Some(value.to_lowercase())
    } else {
        sink.warn(&format!("Invalid data box ID format: {value}"));
        None
    }
}

/// Absolute link to a PDF; site-relative links are resolved against `base`.
pub fn pdf_link(raw: Option<&str>, base: &str, sink: &dyn WarningSink) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let Some(value) = present(raw) else {
        sink.warn("Empty link provided");
        return None;
    };
    let link = if value.starts_with("http://") || value.starts_with("https://") {
        value.to_string()
    } else {
        format!("{}{}", base.trim_end_matches('/'), value)
    };
    if !link.to_lowercase().ends_with(".pdf") {
        sink.warn(&format!("Link does not point to a PDF file: {link}"));
        return None;
    }
    let pattern = r"^https?://[a-zA-Z0-9\u{00C0}-\u{017F}\-._~:/?#\[\]@!$&'()*+,;=%\s]+$";
    if cached(&RE, pattern).is_match(&link) {
        Some(link)
    } else {
        sink.warn(&format!("Invalid URL format: {link}"));
        None
    }
}

/// Issue number within a year, 1 to 12.
pub fn release(raw: Option<&str>, sink: &dyn WarningSink) -> Option<i64> {
    let value = present(raw)?;
    match value.parse::<i64>() {
        Ok(n) if (1..=12).contains(&n) => Some(n),
        Ok(n) => {
            sink.warn(&format!("Release number out of valid range (1-12): {n}"));
            None
        }
        Err(_) => {
            sink.warn(&format!("Invalid release number format: {value}"));
            None
        }
    }
}

pub fn year(raw: Option<&str>, sink: &dyn WarningSink) -> Option<i64> {
    let value = present(raw)?;
    let current = i64::from(Utc::now().year());
    match value.parse::<i64>() {
        Ok(n) if (1970..=current).contains(&n) => Some(n),
        Ok(n) => {
            sink.warn(&format!("Year out of valid range (1970-{current}): {n}"));
            None
        }
        Err(_) => {
            sink.warn(&format!("Invalid year format: {value}"));
            None
        }
    }
}
