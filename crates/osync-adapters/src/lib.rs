//! Source parsers for the municipal website endpoints plus field validators.
//!
//! Parsers turn one fetched body into an ordered list of [`Record`]s. A parser
//! fails with [`ParseError`] only when the structure it relies on is gone;
//! an empty list is a legitimate answer and the category policy decides
//! whether it is acceptable.

use std::sync::{Mutex, OnceLock};

use osync_core::Record;
use osync_storage::ContentKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod contacts;
mod documents;
mod newspapers;
mod portal;
pub mod validators;

pub use documents::{mime_for_extension, ALLOWED_EXTENSIONS};

pub const CRATE_NAME: &str = "osync-adapters";

/// Name under which the municipality itself is listed.
pub const MUNICIPALITY: &str = "Obec Ořechov";

/// Receives field-level warnings; they never abort a parse.
pub trait WarningSink: Send + Sync {
    fn warn(&self, message: &str);
}

/// Keeps warnings in memory.
#[derive(Debug, Default)]
pub struct CollectedWarnings {
    messages: Mutex<Vec<String>>,
}

impl CollectedWarnings {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WarningSink for CollectedWarnings {
    fn warn(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected section not found: {0}")]
    SectionMissing(String),
    #[error("invalid source url `{url}`: {reason}")]
    SourceUrl { url: String, reason: String },
    #[error("selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
}

/// Every parser the registry can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    Schools,
    GeneralContact,
    TownHall,
    PostOffice,
    Firemen,
    Library,
    Doctors,
    Pharmacies,
    PortalContact,
    OfficeHours,
    Employees,
    Newspapers,
    Documents,
}

impl ParserKind {
    pub const ALL: [ParserKind; 13] = [
        Self::Schools,
        Self::GeneralContact,
        Self::TownHall,
        Self::PostOffice,
        Self::Firemen,
        Self::Library,
        Self::Doctors,
        Self::Pharmacies,
        Self::PortalContact,
        Self::OfficeHours,
        Self::Employees,
        Self::Newspapers,
        Self::Documents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schools => "schools",
            Self::GeneralContact => "general-contact",
            Self::TownHall => "town-hall",
            Self::PostOffice => "post-office",
            Self::Firemen => "firemen",
            Self::Library => "library",
            Self::Doctors => "doctors",
            Self::Pharmacies => "pharmacies",
            Self::PortalContact => "portal-contact",
            Self::OfficeHours => "office-hours",
            Self::Employees => "employees",
            Self::Newspapers => "newspapers",
            Self::Documents => "documents",
        }
    }

    pub fn content_kind(self) -> ContentKind {
        match self {
            Self::Newspapers | Self::Documents => ContentKind::Html,
            _ => ContentKind::JsonContent,
        }
    }

    /// Field that carries the record key when the record is stored as a document.
    pub fn key_field(self) -> &'static str {
        match self {
            Self::PortalContact | Self::Employees | Self::Documents => "name",
            Self::OfficeHours => "days",
            Self::Newspapers => "id",
            _ => "title",
        }
    }

    /// Parses one fetched body; `source_url` resolves relative links.
    pub fn parse(
        self,
        raw: &str,
        source_url: &str,
        sink: &dyn WarningSink,
    ) -> Result<Vec<Record>, ParseError> {
        match self {
            Self::Schools => Ok(contacts::schools(raw, sink)),
            Self::GeneralContact => Ok(contacts::general_contact(raw, sink)),
            Self::TownHall => Ok(contacts::town_hall(raw, sink)),
            Self::PostOffice => contacts::post_office(raw, sink),
            Self::Firemen => Ok(contacts::firemen(raw, sink)),
            Self::Library => contacts::library(raw, sink),
            Self::Doctors => Ok(contacts::doctors(raw, sink)),
            Self::Pharmacies => Ok(contacts::pharmacies(raw, sink)),
            Self::PortalContact => portal::main_contact(raw, sink),
            Self::OfficeHours => Ok(portal::office_hours(raw, sink)),
            Self::Employees => portal::employees(raw, sink),
            Self::Newspapers => newspapers::parse(raw, source_url, sink),
            Self::Documents => documents::parse(raw, source_url, sink),
        }
    }
}

impl std::fmt::Display for ParserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Site origin (`scheme://host`) of an absolute url.
pub(crate) fn site_base(source_url: &str) -> Result<String, ParseError> {
    let parsed = url::Url::parse(source_url).map_err(|e| ParseError::SourceUrl {
        url: source_url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(parsed.origin().ascii_serialization())
}

/// Compiles a literal pattern once per call site.
pub(crate) fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

pub(crate) fn selector(css: &str) -> Result<scraper::Selector, ParseError> {
    scraper::Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Entry {
        parser: ParserKind,
    }

    #[test]
    fn every_parser_name_is_accepted_in_config() {
        for kind in ParserKind::ALL {
            let quoted = format!("\"{}\"", kind.as_str());
            let parsed: ParserKind = serde_json::from_str(&quoted).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_parser_names_are_rejected() {
        let err = serde_json::from_str::<Entry>(r#"{"parser": "parse_school_data"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn html_parsers_fetch_html() {
        assert_eq!(ParserKind::Newspapers.content_kind(), ContentKind::Html);
        assert_eq!(ParserKind::Schools.content_kind(), ContentKind::JsonContent);
    }

    #[test]
    fn site_base_strips_path() {
        assert_eq!(
            site_base("https://www.orechovubrna.cz/obec/zpravodaj").unwrap(),
            "https://www.orechovubrna.cz"
        );
        assert!(site_base("not a url").is_err());
    }
}
