//! Municipality contact page as consumed by the citizen portal: the main
//! contact block, office hours and the staff table.

use std::sync::OnceLock;

use osync_core::Record;
use regex::Regex;

use crate::validators::{data_box, dic, email, ic, phone};
use crate::{cached, ParseError, WarningSink, MUNICIPALITY};

const OFFICE_HOURS_HEADING: &str = "**Úřední hodiny:**";

fn labelled<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

pub(crate) fn main_contact(raw: &str, sink: &dyn WarningSink) -> Result<Vec<Record>, ParseError> {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    static TEL: OnceLock<Regex> = OnceLock::new();
    static MOBILE: OnceLock<Regex> = OnceLock::new();
    static MAIL: OnceLock<Regex> = OnceLock::new();
    static MAINTENANCE: OnceLock<Regex> = OnceLock::new();
    static DATA_BOX: OnceLock<Regex> = OnceLock::new();
    static IC: OnceLock<Regex> = OnceLock::new();
    static DIC: OnceLock<Regex> = OnceLock::new();
    static ACCOUNT: OnceLock<Regex> = OnceLock::new();

    let main = raw.split(OFFICE_HOURS_HEADING).next().unwrap_or_default();
    let address_pattern = format!(
        r"(?s)\*\*{}\*\*\r\n(.*?)(?:\r\n\r\nTel\.:|$)",
        regex::escape(MUNICIPALITY)
    );

    let record = Record::new(MUNICIPALITY)
        .with("address", labelled(cached(&ADDRESS, &address_pattern), main))
        .with("phone", phone(labelled(cached(&TEL, r"Tel\.:\s*([^\n]+)"), main), sink))
        .with("mobile", phone(labelled(cached(&MOBILE, r"Mobil:\s*([^\n]+)"), main), sink))
        .with("email", email(labelled(cached(&MAIL, r"E-mail:\s*([^\n]+)"), main), sink))
        .with(
            "maintenance",
            email(labelled(cached(&MAINTENANCE, r"Údržba obce:\s*([^\n]+)"), main), sink),
        )
        .with(
            "data_id",
            data_box(labelled(cached(&DATA_BOX, r"ID datové schránky:\s*([^\n]+)"), main), sink),
        )
        // `\b` keeps `IČ:` from matching inside `DIČ:`.
        .with("ic", ic(labelled(cached(&IC, r"\bIČ:\s*([^\n]+)"), main), sink))
        .with("dic", dic(labelled(cached(&DIC, r"DIČ:\s*([^\n]+)"), main), sink))
        .with("bank_account", labelled(cached(&ACCOUNT, r"č\.ú\.:\s*([^\n]+)"), main));

    if record.fields.is_empty() {
        return Err(ParseError::SectionMissing("main contact".into()));
    }
    Ok(vec![record])
}

/// `days: time` lines under the office hours heading. A page without the
/// heading yields no records.
pub(crate) fn office_hours(raw: &str, sink: &dyn WarningSink) -> Vec<Record> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let section = cached(
        &RE,
        r"\*\*Úřední hodiny:\*\*\r\n([\s\S]*?)(?:\r\n\r\n\.\[stack\]|\r\n\r\n\*\*|$)",
    );
    let Some(hours) = section.captures(raw).and_then(|caps| caps.get(1)) else {
        sink.warn("No office hours section found in content");
        return Vec::new();
    };
    hours
        .as_str()
        .split('\n')
        .filter_map(|line| line.trim().split_once(':'))
        .map(|(days, time)| Record::new(days.trim()).with("time", Some(time.trim())))
        .filter(|record| !record.key.is_empty())
        .collect()
}

pub(crate) fn employees(raw: &str, sink: &dyn WarningSink) -> Result<Vec<Record>, ParseError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let rows: Vec<Record> = cached(
        &RE,
        r"\|\s*\*\*(.+?)\*\*\s*\|\s*(.+?)\s*\|\s*(.+?)\s*\|\s*([^\r\n]+)",
    )
    .captures_iter(raw)
    .map(|caps| {
        Record::new(caps[1].trim())
            .with("position", Some(caps[2].trim()))
            .with("phone", phone(Some(caps[3].trim()), sink))
            .with("email", email(Some(caps[4].trim()), sink))
    })
    .collect();
    if rows.is_empty() {
        return Err(ParseError::SectionMissing("employees table".into()));
    }
    Ok(rows)
}
