//! Document listings: `<li><a href="...">Name (PDF, 120 kB)</a></li>`.

use osync_core::Record;
use scraper::Html;
use url::Url;

use crate::{selector, ParseError, WarningSink};

/// Only these file types are ever downloaded.
pub const ALLOWED_EXTENSIONS: [&str; 6] = ["pdf", "doc", "docx", "xls", "xlsx", "txt"];

pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "pdf" => Some("application/pdf"),
        "doc" => Some("application/msword"),
        "docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        "xls" => Some("application/vnd.ms-excel"),
        "xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        "txt" => Some("text/plain"),
        _ => None,
    }
}

fn allowed_extension(href: &str) -> Option<&'static str> {
    let lower = href.to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .into_iter()
        .find(|ext| lower.ends_with(&format!(".{ext}")))
}

pub(crate) fn parse(
    raw: &str,
    source_url: &str,
    sink: &dyn WarningSink,
) -> Result<Vec<Record>, ParseError> {
    let page = Url::parse(source_url).map_err(|e| ParseError::SourceUrl {
        url: source_url.to_string(),
        reason: e.to_string(),
    })?;
    let items = selector("li")?;
    let anchor = selector("a[href]")?;
    let document = Html::parse_document(raw);

    let mut records = Vec::new();
    for item in document.select(&items) {
        let Some(link) = item.select(&anchor).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(extension) = allowed_extension(href) else {
            continue;
        };
        let url = match page.join(href) {
            Ok(url) => url,
            Err(err) => {
                sink.warn(&format!("Cannot resolve link {href}: {err}"));
                continue;
            }
        };
        let label = link.text().collect::<String>();
        let name = label.split('(').next().unwrap_or_default().trim();
        if name.is_empty() {
            sink.warn(&format!("Skipping unnamed document {url}"));
            continue;
        }
        records.push(
            Record::new(name)
                .with("url", Some(url.as_str()))
                .with("file_type", Some(extension))
                .with("mime_type", mime_for_extension(extension)),
        );
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CollectedWarnings;

    const PAGE: &str = r#"<ul>
        <li><a href="files/zapis-2024-01.pdf">Zápis ze zasedání 1/2024 (PDF, 120 kB)</a></li>
        <li><a href="/files/rozpocet.XLSX">Rozpočet 2024</a></li>
        <li><a href="/obec/historie">Historie obce</a></li>
        <li><a href="/files/mapa.exe">Mapa</a></li>
    </ul>"#;

    #[test]
    fn only_allowed_file_types_are_listed() {
        let sink = CollectedWarnings::default();
        let records = parse(PAGE, "https://www.orechovubrna.cz/obec/dokumenty/", &sink).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].key, "Zápis ze zasedání 1/2024");
        assert_eq!(
            records[0].text("url"),
            Some("https://www.orechovubrna.cz/obec/dokumenty/files/zapis-2024-01.pdf")
        );
        assert_eq!(records[0].text("mime_type"), Some("application/pdf"));

        assert_eq!(records[1].text("file_type"), Some("xlsx"));
        assert_eq!(
            records[1].text("url"),
            Some("https://www.orechovubrna.cz/files/rozpocet.XLSX")
        );
    }

    #[test]
    fn extension_map_covers_every_allowed_type() {
        for ext in ALLOWED_EXTENSIONS {
            assert!(mime_for_extension(ext).is_some(), "{ext}");
        }
        assert_eq!(mime_for_extension("exe"), None);
    }
}
