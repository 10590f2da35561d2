//! Archive page of the municipal newsletter ("zpravodaj"). Each `<li>`
//! links one issue; the issue is named either `Zpravodaj 3/2024` or, for
//! older issues, `Zpravodaj březen 2016`.

use std::sync::OnceLock;

use osync_core::{composite_key, Record};
use regex::Regex;
use scraper::Html;

use crate::validators::{pdf_link, release, year};
use crate::{cached, selector, site_base, ParseError, WarningSink};

const MONTHS: [(&str, i64); 23] = [
    ("leden", 1),
    ("ledna", 1),
    ("únor", 2),
    ("února", 2),
    ("březen", 3),
    ("března", 3),
    ("duben", 4),
    ("dubna", 4),
    ("květen", 5),
    ("května", 5),
    ("červen", 6),
    ("června", 6),
    ("červenec", 7),
    ("července", 7),
    ("srpen", 8),
    ("srpna", 8),
    ("září", 9),
    ("říjen", 10),
    ("října", 10),
    ("listopad", 11),
    ("listopadu", 11),
    ("prosinec", 12),
    ("prosince", 12),
];

/// `(release, year)` as written in the item text.
fn issue_of(text: &str) -> Option<(String, String)> {
    static NUMBERED: OnceLock<Regex> = OnceLock::new();
    static MONTHLY: OnceLock<Regex> = OnceLock::new();
    if let Some(caps) = cached(&NUMBERED, r"zpravodaj ([0-9]+)/([0-9]{4})").captures(text) {
        return Some((caps[1].to_string(), caps[2].to_string()));
    }
    let caps = cached(&MONTHLY, r"zpravodaj\s+(\p{L}+)\s+([0-9]{4})").captures(text)?;
    let month = MONTHS
        .iter()
        .find(|(name, _)| *name == &caps[1])
        .map(|(_, number)| number)?;
    Some((month.to_string(), caps[2].to_string()))
}

pub(crate) fn parse(
    raw: &str,
    source_url: &str,
    sink: &dyn WarningSink,
) -> Result<Vec<Record>, ParseError> {
    let base = site_base(source_url)?;
    let items = selector("li")?;
    let anchor = selector("a[href]")?;
    let document = Html::parse_document(raw);

    let mut records = Vec::new();
    for item in document.select(&items) {
        let text = item.text().collect::<String>().to_lowercase();
        if !text.contains("zpravodaj") {
            continue;
        }
        let Some(href) = item
            .select(&anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let Some((raw_release, raw_year)) = issue_of(&text) else {
            sink.warn(&format!("Couldn't parse {}", text.trim()));
            continue;
        };
        let (Some(link), Some(issue_release), Some(issue_year)) = (
            pdf_link(Some(href), &base, sink),
            release(Some(raw_release.as_str()), sink),
            year(Some(raw_year.as_str()), sink),
        ) else {
            continue;
        };
        let id = composite_key(issue_year, issue_release);
        records.push(
            Record::new(id.to_string())
                .with("id", Some(id))
                .with("link", Some(link))
                .with("release", Some(issue_release))
                .with("year", Some(issue_year)),
        );
    }
    Ok(records)
}
