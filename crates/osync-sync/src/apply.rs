//! Turns a [`DiffResult`] into store writes.

use std::collections::BTreeMap;

use osync_core::{DiffResult, Disposition};
use osync_storage::{
    ContentSource, DocumentStore, RowInsert, RowPlan, RowStore, RowUpdate, StoreError, TableSpec,
};
use serde_json::{Map, Value as JsonValue};

use crate::sinks::AuditSink;

/// Audit trail of a diff, written before anything touches the store.
pub fn log_diff(diff: &DiffResult, sink: &dyn AuditSink) {
    for key in &diff.duplicates {
        sink.warn(&format!("Duplicate key in fetched data, keeping the last one: {key}"));
    }
    for bad in &diff.skipped {
        sink.warn(&format!(
            "Skipping stored entry at {}: {}",
            bad.position, bad.reason
        ));
    }
    for key in &diff.added {
        sink.info(&format!("Added: {key}"));
    }
    for key in &diff.modified {
        let changes = diff
            .changes
            .get(key)
            .map(|changes| {
                changes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        sink.info(&format!("Modified: {key} ({changes})"));
    }
    for key in &diff.removed {
        sink.info(&format!("Removed: {key}"));
    }
    for key in &diff.retained {
        sink.info(&format!("Kept (not from website): {key}"));
    }
    sink.info(&format!("Update summary: {}", diff.summary()));
}

/// The complete merged collection with the leading `null` sentinel.
pub fn full_collection(diff: &DiffResult, key_field: &str) -> JsonValue {
    let mut items = Vec::with_capacity(diff.entries.len() + 1);
    items.push(JsonValue::Null);
    items.extend(diff.entries.iter().map(|e| e.record.to_document(key_field)));
    JsonValue::Array(items)
}

pub async fn apply_full_replace(
    store: &dyn DocumentStore,
    path: &str,
    key_field: &str,
    diff: &DiffResult,
) -> Result<(), StoreError> {
    if !diff.changed {
        return Ok(());
    }
    store.set(path, &full_collection(diff, key_field)).await
}

/// Multi-path patch: whole records for added keys, single fields for
/// modified keys, `null` for removed keys.
pub fn keyed_patch(diff: &DiffResult) -> Map<String, JsonValue> {
    let mut patch = Map::new();
    for entry in diff.upserts() {
        let key = &entry.record.key;
        match entry.disposition {
            Disposition::Added => {
                patch.insert(key.clone(), entry.record.fields_document());
            }
            Disposition::Modified => {
                for change in diff.changes.get(key).into_iter().flatten() {
                    patch.insert(
                        format!("{key}/{}", change.field()),
                        change.new_value().to_json(),
                    );
                }
            }
            Disposition::Unchanged | Disposition::Retained => {}
        }
    }
    for key in &diff.removed {
        patch.insert(key.clone(), JsonValue::Null);
    }
    patch
}

pub async fn apply_keyed_patch(
    store: &dyn DocumentStore,
    path: &str,
    diff: &DiffResult,
) -> Result<(), StoreError> {
    if !diff.changed {
        return Ok(());
    }
    store.update(path, &keyed_patch(diff)).await
}

/// Row operations: removed keys, changed columns of modified keys, and new rows.
pub fn row_plan(diff: &DiffResult) -> RowPlan {
    let mut plan = RowPlan {
        deletes: diff.removed.iter().cloned().collect(),
        ..RowPlan::default()
    };
    for entry in diff.upserts() {
        let key = entry.record.key.clone();
        match entry.disposition {
            Disposition::Added => plan.inserts.push(RowInsert {
                key,
                columns: entry.record.fields.clone(),
                blob: None,
            }),
            Disposition::Modified => {
                let columns = diff
                    .changes
                    .get(&key)
                    .into_iter()
                    .flatten()
                    .map(|c| (c.field().to_string(), c.new_value().clone()))
                    .collect();
                plan.updates.push(RowUpdate {
                    key,
                    columns,
                    blob: None,
                });
            }
            Disposition::Unchanged | Disposition::Retained => {}
        }
    }
    plan
}

/// Human readable byte count (`1.50 KB`).
pub fn format_file_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} GB")
}

async fn download_blob(
    key: &str,
    urls: &BTreeMap<String, String>,
    content: &dyn ContentSource,
    limit_bytes: u64,
    sink: &dyn AuditSink,
) -> Option<Vec<u8>> {
    let Some(url) = urls.get(key) else {
        sink.error(&format!("No download url for {key}"));
        return None;
    };
    match content.download(url, limit_bytes).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            sink.error(&format!("Failed to download {key} from {url}: {err}"));
            None
        }
    }
}

/// Downloads the content of every inserted or updated file. Files that cannot
/// be downloaded are dropped from the plan, so the stored row stays as it was.
/// Returns the number of bytes downloaded.
pub async fn attach_downloads(
    plan: &mut RowPlan,
    urls: &BTreeMap<String, String>,
    content: &dyn ContentSource,
    limit_bytes: u64,
    sink: &dyn AuditSink,
) -> u64 {
    let mut total = 0u64;

    let mut inserts = Vec::with_capacity(plan.inserts.len());
    for mut insert in std::mem::take(&mut plan.inserts) {
        if let Some(bytes) = download_blob(&insert.key, urls, content, limit_bytes, sink).await {
            total += bytes.len() as u64;
            insert.blob = Some(bytes);
            inserts.push(insert);
        }
    }
    let mut updates = Vec::with_capacity(plan.updates.len());
    for mut update in std::mem::take(&mut plan.updates) {
        if let Some(bytes) = download_blob(&update.key, urls, content, limit_bytes, sink).await {
            total += bytes.len() as u64;
            update.blob = Some(bytes);
            updates.push(update);
        }
    }
    plan.inserts = inserts;
    plan.updates = updates;
    total
}

pub async fn apply_rows(
    store: &dyn RowStore,
    table: &TableSpec,
    plan: &RowPlan,
) -> Result<(), StoreError> {
    if plan.is_empty() {
        return Ok(());
    }
    store.apply(table, plan).await
}
