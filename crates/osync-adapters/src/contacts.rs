//! Contact directory sections of the website API (`{"content": "..."}`
//! markdown-ish prose with `\r\n` line breaks and `**bold**` titles).

use std::sync::OnceLock;

use osync_core::Record;
use regex::Regex;

use crate::validators::{email, phone, url};
use crate::{cached, ParseError, WarningSink, MUNICIPALITY};

const SECTION_SEPARATOR: &str = "\r\n#####\r\n";

fn bold() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\*\*(.+?)\*\*")
}

/// First capture group of `re` in `text`, trimmed.
fn capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

fn tel(text: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    capture(cached(&RE, r"Tel\.: ([^\r\n]+)"), text)
}

fn mail(text: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    capture(cached(&RE, r"E-mail: ([^\r\n]+)"), text)
}

fn web(text: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    capture(cached(&RE, r"Web: ([^\r\n]+)"), text)
}

/// `**Title**` blocks with the text up to the next `**` (or the end).
fn bold_sections(raw: &str) -> Vec<(&str, &str)> {
    let mut sections = Vec::new();
    let mut pos = 0;
    while let Some(caps) = bold().captures_at(raw, pos) {
        let (Some(whole), Some(title)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let start = whole.end();
        if start >= raw.len() {
            break;
        }
        // The details take at least one character before the next marker.
        let next_char = raw[start..].chars().next().map_or(1, char::len_utf8);
        let end = raw[start + next_char..]
            .find("**")
            .map_or(raw.len(), |offset| start + next_char + offset);
        sections.push((title.as_str(), &raw[start..end]));
        pos = end;
    }
    sections
}

/// Line directly above the first `Tel.:` line.
fn address_before_tel(details: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    capture(cached(&RE, r"([^\r\n]+)\r?\nTel\.:"), details)
}

pub(crate) fn schools(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    bold_sections(raw)
        .into_iter()
        .map(|(title, details)| {
            Record::new(title.trim())
                .with("address", address_before_tel(details))
                .with("phone", phone(tel(details), sink))
                .with("mail", email(mail(details), sink))
                .with("web", url(web(details), sink))
        })
        .collect()
}

pub(crate) fn general_contact(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    static MOBILE: OnceLock<Regex> = OnceLock::new();
    static MAINTENANCE: OnceLock<Regex> = OnceLock::new();
    let mobile = capture(cached(&MOBILE, r"Mobil: ([^\r\n]+)"), raw);
    let maintenance = capture(cached(&MAINTENANCE, r"Údržba obce: ([^\r\n]+)"), raw);
    vec![Record::new(MUNICIPALITY)
        .with("phone", phone(tel(raw), sink))
        .with("phone2", phone(mobile, sink))
        .with("mail", email(mail(raw), sink))
        .with("maintenance", maintenance)
        .with("web", url(web(raw), sink))]
}

/// Staff table rows: `| **Name**| position | phone | email`.
pub(crate) fn town_hall(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"\| \*\*(.+?)\*\*\| (.+?) \| (.+?) \| ([^\r\n]+)")
        .captures_iter(raw)
        .map(|caps| {
            Record::new(caps[1].trim())
                .with("subtitle", Some(caps[2].trim()))
                .with("phone", phone(Some(&caps[3]), sink))
                .with("mail", email(Some(&caps[4]), sink))
        })
        .collect()
}

pub(crate) fn post_office(raw: &str, sink: &dyn WarningSink) -> Result<Vec<Record>, ParseError> {
    let title = bold()
        .captures(raw)
        .and_then(|caps| caps.get(0).zip(caps.get(1)))
        .ok_or_else(|| ParseError::SectionMissing("post office title".into()))?;
    let (whole, name) = title;
    let rest = &raw[whole.end()..];
    let address = rest[..rest.find("Tel.").unwrap_or(rest.len())].trim();
    Ok(vec![Record::new(name.as_str().trim())
        .with("address", Some(address))
        .with("phone", phone(tel(raw), sink))
        .with("mail", email(mail(raw), sink))
        .with("web", url(web(raw), sink))])
}

pub(crate) fn firemen(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    bold_sections(raw)
        .into_iter()
        .map(|(title, details)| {
            Record::new(title.trim())
                .with("phone", phone(tel(details), sink))
                .with("mail", email(mail(details), sink))
                .with("web", url(web(details), sink))
        })
        .collect()
}

/// Only the first phone number and e-mail of the page are kept.
pub(crate) fn library(raw: &str, sink: &dyn WarningSink) -> Result<Vec<Record>, ParseError> {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    static MAIL: OnceLock<Regex> = OnceLock::new();
    let title = capture(bold(), raw)
        .ok_or_else(|| ParseError::SectionMissing("library title".into()))?;
    let first_phone = cached(&PHONE, r"\+420 [0-9]{3} [0-9]{3} [0-9]{3}")
        .find(raw)
        .map(|m| m.as_str());
    let first_mail = cached(&MAIL, r"[\w.-]+@[\w.-]+\.\w+")
        .find(raw)
        .map(|m| m.as_str());
    Ok(vec![Record::new(title)
        .with("phone", phone(first_phone, sink))
        .with("mail", email(first_mail, sink))
        .with("web", url(web(raw), sink))])
}

/// `(title, body)` pairs of a `#####`-separated listing; a section's title
/// is the last line of the section before it.
fn titled_sections(raw: &str) -> Vec<(&str, &str)> {
    let sections: Vec<&str> = raw.split(SECTION_SEPARATOR).collect();
    sections
        .windows(2)
        .filter_map(|pair| {
            let title = pair[0].lines().last()?.trim();
            (!title.is_empty()).then_some((title, pair[1]))
        })
        .collect()
}

fn is_pharmacy(title: &str) -> bool {
    title.contains("Lékárna")
}

fn line_after(label: &str, section: &str) -> Option<String> {
    section
        .split("\r\n")
        .find_map(|line| line.strip_prefix(label))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn doctors(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    let address_re = cached(&ADDRESS, r"\*\*\r\n([^*\r\n]+)(?:\r\nTel\.:|$)");
    titled_sections(raw)
        .into_iter()
        .filter(|(title, _)| !is_pharmacy(title))
        .map(|(title, section)| {
            Record::new(title)
                .with("subtitle", capture(bold(), section))
                .with("address", capture(address_re, section))
                .with("phone", phone(line_after("Tel.: ", section).as_deref(), sink))
                .with("mail", email(line_after("E-mail: ", section).as_deref(), sink))
                .with("web", url(line_after("Web: ", section).as_deref(), sink))
        })
        .collect()
}

pub(crate) fn pharmacies(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    let address_re = cached(&ADDRESS, r"^([^\n]+?)(?:\r\nTel\.:|$)");
    titled_sections(raw)
        .into_iter()
        .filter(|(title, _)| is_pharmacy(title))
        .map(|(title, section)| {
            Record::new(title)
                .with("address", capture(address_re, section))
                .with("phone", phone(line_after("Tel.: ", section).as_deref(), sink))
                .with("mail", email(line_after("E-mail: ", section).as_deref(), sink))
                .with("web", url(line_after("Web: ", section).as_deref(), sink))
        })
        .collect()
}
