use std::sync::Arc;

use osync_core::FieldValue;
use osync_storage::{DocumentStore, JsonFileStore, MemoryRowStore, Row, StaticContentSource};
use osync_sync::{CategoryOutcome, Registry, Runner, SyncError};
use serde_json::json;
use tempfile::{tempdir, TempDir};

const REGISTRY: &str = r#"
categories:
  - name: schools
    endpoint: https://obec.test/api/skoly/
    parser: schools
    log_name: schools.log
    store:
      kind: full-replace
      path: contact_item/schools
  - name: newspapers
    endpoint: https://www.orechovubrna.cz/zpravodaj
    parser: newspapers
    log_name: newspapers.log
    delete_missing: false
    store:
      kind: keyed-patch
      path: newspapers
  - name: employees
    endpoint: https://obec.test/api/kontakty/
    parser: employees
    log_name: employees.log
    store:
      kind: rows
      table: employees
      key_column: name
      provenance_column: fromWebsite
      scope:
        kind: fixed
        column: contactId
        value: 1
  - name: zastupitelstvo
    endpoint: https://obec.test/obec/dokumenty/
    parser: documents
    log_name: documents.log
    store:
      kind: rows
      table: File
      key_column: name
      provenance_column: fromWebsite
      blob_column: content
      scope:
        kind: parent
        column: folderId
        table: Folder
        name_column: name
        name: Zastupitelstvo
        id_column: id
"#;

const SCHOOLS_URL: &str = "https://obec.test/api/skoly/";
const EMPLOYEES_URL: &str = "https://obec.test/api/kontakty/";
const NEWSPAPERS_URL: &str = "https://www.orechovubrna.cz/zpravodaj";
const DOCUMENTS_URL: &str = "https://obec.test/obec/dokumenty/";

fn registry() -> Registry {
    Registry::from_yaml("pipeline", REGISTRY).expect("registry parses")
}

fn envelope(content: &str) -> String {
    json!({ "content": content }).to_string()
}

struct Harness {
    dir: TempDir,
    documents: Arc<JsonFileStore>,
    rows: Arc<MemoryRowStore>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let documents = Arc::new(JsonFileStore::new(dir.path().join("db.json")));
        Self {
            dir,
            documents,
            rows: Arc::new(MemoryRowStore::new()),
        }
    }

    fn runner(&self, content: StaticContentSource) -> Runner {
        Runner::new(Arc::new(content), self.dir.path().join("logs"))
            .with_documents(self.documents.clone())
            .with_rows(self.rows.clone())
    }

    fn store_bytes(&self) -> Vec<u8> {
        std::fs::read(self.documents.path()).unwrap_or_default()
    }

    fn log(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join("logs").join(name)).unwrap_or_default()
    }
}

async fn run_one(runner: &Runner, name: &str) -> CategoryOutcome {
    let mut report = runner.run_only(&registry(), name).await.unwrap();
    report.outcomes.pop().map(|(_, outcome)| outcome).unwrap()
}

fn stored_row(pairs: &[(&str, FieldValue)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn contacts_end_to_end_adds_the_new_record() {
    let harness = Harness::new();
    harness
        .documents
        .set(
            "contact_item/schools",
            &json!([null, {"title": "A", "phone": "+420 111 111 111"}]),
        )
        .await
        .unwrap();
    let content = StaticContentSource::new().with_page(
        SCHOOLS_URL,
        envelope("**A**\r\nTel.: 111 111 111\r\n\r\n**B**\r\nTel.: 222 222 222"),
    );
    let runner = harness.runner(content);

    match run_one(&runner, "schools").await {
        CategoryOutcome::Applied(summary) => {
            assert_eq!(summary.added, vec!["B".to_string()]);
            assert!(summary.modified.is_empty());
            assert!(summary.removed.is_empty());
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let stored = harness.documents.get("contact_item/schools").await.unwrap();
    assert_eq!(
        stored,
        Some(json!([
            null,
            {"title": "A", "phone": "+420 111 111 111"},
            {"title": "B", "phone": "+420 222 222 222"}
        ]))
    );
    let log = harness.log("schools.log");
    assert!(log.contains("Added: B"));
    assert!(log.contains("Update summary: added=1"));
}

#[tokio::test]
async fn second_run_with_identical_content_changes_nothing() {
    let harness = Harness::new();
    let content = StaticContentSource::new().with_page(
        SCHOOLS_URL,
        envelope("**A**\r\nTel.: 111 111 111\r\n\r\n**B**\r\nTel.: 222 222 222"),
    );
    let runner = harness.runner(content);

    assert!(matches!(
        run_one(&runner, "schools").await,
        CategoryOutcome::Applied(_)
    ));
    let after_first = harness.store_bytes();
    assert!(matches!(
        run_one(&runner, "schools").await,
        CategoryOutcome::Unchanged
    ));
    assert_eq!(harness.store_bytes(), after_first);
}

#[tokio::test]
async fn changed_field_is_updated_and_unfetched_fields_survive() {
    let harness = Harness::new();
    harness
        .documents
        .set(
            "contact_item/schools",
            &json!([null, {"title": "A", "phone": "+420 111 111 111", "note": "ručně"}]),
        )
        .await
        .unwrap();
    let content = StaticContentSource::new()
        .with_page(SCHOOLS_URL, envelope("**A**\r\nTel.: 333 333 333"));
    let runner = harness.runner(content);

    match run_one(&runner, "schools").await {
        CategoryOutcome::Applied(summary) => assert_eq!(summary.modified, vec!["A".to_string()]),
        other => panic!("unexpected outcome {other:?}"),
    }
    let stored = harness.documents.get("contact_item/schools").await.unwrap();
    assert_eq!(
        stored,
        Some(json!([null, {"title": "A", "phone": "+420 333 333 333", "note": "ručně"}]))
    );
}

#[tokio::test]
async fn empty_fetch_fails_and_leaves_the_store_untouched() {
    let harness = Harness::new();
    harness
        .documents
        .set(
            "contact_item/schools",
            &json!([null, {"title": "A", "phone": "+420 111 111 111"}]),
        )
        .await
        .unwrap();
    let before = harness.store_bytes();
    let content =
        StaticContentSource::new().with_page(SCHOOLS_URL, envelope("Stránka se připravuje"));
    let runner = harness.runner(content);

    assert!(matches!(
        run_one(&runner, "schools").await,
        CategoryOutcome::Failed(SyncError::EmptyResult)
    ));
    assert_eq!(harness.store_bytes(), before);
    assert!(harness.log("schools.log").contains("Update failed"));
}

#[tokio::test]
async fn duplicate_keys_keep_the_last_record() {
    let harness = Harness::new();
    let content = StaticContentSource::new().with_page(
        SCHOOLS_URL,
        envelope("**A**\r\nTel.: 111 111 111\r\n\r\n**A**\r\nTel.: 333 333 333"),
    );
    let runner = harness.runner(content);

    run_one(&runner, "schools").await;
    let stored = harness.documents.get("contact_item/schools").await.unwrap();
    assert_eq!(
        stored,
        Some(json!([null, {"title": "A", "phone": "+420 333 333 333"}]))
    );
    assert!(harness.log("schools.log").contains("Duplicate key"));
}

#[tokio::test]
async fn newspaper_link_change_writes_only_the_link() {
    let harness = Harness::new();
    harness
        .documents
        .set(
            "newspapers",
            &json!({
                "202401": {"id": 202401, "link": "old.pdf", "year": 2024, "release": 1},
                "201603": {"id": 201603, "link": "https://www.orechovubrna.cz/b.pdf", "year": 2016, "release": 3}
            }),
        )
        .await
        .unwrap();
    let page = r#"<ul>
        <li><a href="/assets/zpravodaj-1-2024.pdf">Ořechovský zpravodaj 1/2024</a></li>
    </ul>"#;
    let runner = harness.runner(StaticContentSource::new().with_page(NEWSPAPERS_URL, page));

    match run_one(&runner, "newspapers").await {
        CategoryOutcome::Applied(summary) => {
            assert_eq!(summary.modified, vec!["202401".to_string()]);
            assert!(summary.removed.is_empty());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let stored = harness.documents.get("newspapers").await.unwrap().unwrap();
    assert_eq!(
        stored["202401"],
        json!({
            "id": 202401,
            "link": "https://www.orechovubrna.cz/assets/zpravodaj-1-2024.pdf",
            "year": 2024,
            "release": 1
        })
    );
    assert_eq!(stored["201603"]["release"], json!(3));
}

async fn seed_employees(rows: &MemoryRowStore) {
    for (name, from_website) in [("Jan Novák", true), ("Petr Starý", false), ("Ivana Bývalá", true)] {
        rows.insert_row(
            "employees",
            stored_row(&[
                ("name", FieldValue::from(name)),
                ("position", FieldValue::from("referent")),
                ("fromWebsite", FieldValue::Bool(from_website)),
                ("contactId", FieldValue::Integer(1)),
            ]),
        )
        .await;
    }
}

const EMPLOYEES: &str = "**Kontakty**\r\n| **Jan Novák** | starosta | 547 225 121 | starosta@orechovubrna.cz\r\n| **Eva Malá** | účetní | 547 225 122 | ucetni@orechovubrna.cz";

#[tokio::test]
async fn rows_never_delete_manually_curated_entries() {
    let harness = Harness::new();
    seed_employees(&harness.rows).await;
    let runner = harness
        .runner(StaticContentSource::new().with_page(EMPLOYEES_URL, envelope(EMPLOYEES)));

    match run_one(&runner, "employees").await {
        CategoryOutcome::Applied(summary) => {
            assert_eq!(summary.added, vec!["Eva Malá".to_string()]);
            assert_eq!(summary.modified, vec!["Jan Novák".to_string()]);
            assert_eq!(summary.removed, vec!["Ivana Bývalá".to_string()]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let rows = harness.rows.rows("employees").await;
    let names: Vec<_> = rows.iter().map(|r| r["name"].to_string()).collect();
    assert_eq!(names, vec!["Jan Novák", "Petr Starý", "Eva Malá"]);

    let jan = &rows[0];
    assert_eq!(jan["position"], FieldValue::from("starosta"));
    assert_eq!(jan["fromWebsite"], FieldValue::Bool(true));
    let eva = &rows[2];
    assert_eq!(eva["fromWebsite"], FieldValue::Bool(true));
    assert_eq!(eva["contactId"], FieldValue::Integer(1));
}

#[tokio::test]
async fn failed_transaction_rolls_back_every_row() {
    let harness = Harness::new();
    seed_employees(&harness.rows).await;
    let before = harness.rows.rows("employees").await;
    harness.rows.fail_next_apply().await;
    let runner = harness
        .runner(StaticContentSource::new().with_page(EMPLOYEES_URL, envelope(EMPLOYEES)));

    assert!(matches!(
        run_one(&runner, "employees").await,
        CategoryOutcome::Failed(SyncError::Apply(_))
    ));
    assert_eq!(harness.rows.rows("employees").await, before);
}

#[tokio::test]
async fn documents_are_probed_downloaded_and_stored() {
    let harness = Harness::new();
    harness.rows.create_table("File").await;
    let page = r#"<ul>
        <li><a href="zapis-1.pdf">Zápis 1/2024 (PDF, 6 B)</a></li>
        <li><a href="chybi.pdf">Chybějící soubor</a></li>
        <li><a href="/kontakty">Kontakty</a></li>
    </ul>"#;
    let content = StaticContentSource::new()
        .with_page(DOCUMENTS_URL, page)
        .with_file(
            "https://obec.test/obec/dokumenty/zapis-1.pdf",
            b"%PDF-1".to_vec(),
            Some("application/pdf"),
        );
    let runner = harness.runner(content);

    match run_one(&runner, "zastupitelstvo").await {
        CategoryOutcome::Applied(summary) => {
            assert_eq!(summary.added, vec!["Zápis 1/2024".to_string()])
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let files = harness.rows.rows("File").await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["file_size"], FieldValue::Integer(6));
    assert_eq!(files[0]["mime_type"], FieldValue::from("application/pdf"));
    assert_eq!(
        harness.rows.blob("File", "Zápis 1/2024").await.as_deref(),
        Some(&b"%PDF-1"[..])
    );
    assert_eq!(harness.rows.rows("Folder").await.len(), 1);
    let log = harness.log("documents.log");
    assert!(log.contains("Cannot probe"));
    assert!(log.contains("Total data downloaded: 6.00 B"));

    assert!(matches!(
        run_one(&runner, "zastupitelstvo").await,
        CategoryOutcome::Unchanged
    ));
}

#[tokio::test]
async fn one_failing_category_fails_the_run_but_not_the_others() {
    let harness = Harness::new();
    let content = StaticContentSource::new()
        .with_page(SCHOOLS_URL, envelope("**A**\r\nTel.: 111 111 111"))
        .with_page(NEWSPAPERS_URL, "<ul></ul>");
    let runner = harness.runner(content);

    let report = runner.run(&registry()).await.unwrap();
    assert!(!report.success());
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed, vec!["newspapers", "employees", "zastupitelstvo"]);
    assert!(matches!(report.outcomes[0].1, CategoryOutcome::Applied(_)));
    assert!(harness.documents.path().exists());
}
