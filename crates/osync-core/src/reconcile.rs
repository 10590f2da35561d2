//! Diff + merge of freshly parsed records against the stored collection.
//!
//! The reconciler is a pure function: it performs no I/O and decides both
//! what changed and what the store should look like afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FieldValue, MalformedEntry, Record, StoredCollection, StoredRecord};

/// Per-category knobs of the reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePolicy {
    /// Stored boolean marking website-sourced records. When set, records
    /// without `true` here are never removed.
    pub provenance_field: Option<String>,
    /// When false, keys missing from the fetch are always kept.
    pub delete_missing: bool,
    /// Whitelists an empty fetch as a legitimate result.
    pub allow_empty: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            provenance_field: None,
            delete_missing: true,
            allow_empty: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("no records parsed; the store was left untouched")]
    EmptyResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldChange {
    Added {
        field: String,
        value: FieldValue,
    },
    Changed {
        field: String,
        old: FieldValue,
        new: FieldValue,
    },
}

impl FieldChange {
    pub fn field(&self) -> &str {
        match self {
            Self::Added { field, .. } | Self::Changed { field, .. } => field,
        }
    }

    pub fn new_value(&self) -> &FieldValue {
        match self {
            Self::Added { value, .. } => value,
            Self::Changed { new, .. } => new,
        }
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added { field, value } => write!(f, "{field}: + {value}"),
            Self::Changed { field, old, new } => write!(f, "{field}: {old} -> {new}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Added,
    Modified,
    Unchanged,
    /// Missing from the fetch but kept (provenance or `delete_missing = false`).
    Retained,
}

/// One record of the post-merge collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntry {
    pub disposition: Disposition,
    pub record: Record,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub retained: BTreeSet<String>,
    /// Field-level changes of every modified key.
    pub changes: BTreeMap<String, Vec<FieldChange>>,
    /// Complete merged collection: fetch order, then retained records in store order.
    pub entries: Vec<MergedEntry>,
    /// Keys that appeared more than once in the fetch (last one wins).
    pub duplicates: Vec<String>,
    pub skipped: Vec<MalformedEntry>,
    pub changed: bool,
}

impl DiffResult {
    pub fn merged(&self, key: &str) -> Option<&Record> {
        self.entries
            .iter()
            .map(|e| &e.record)
            .find(|record| record.key == key)
    }

    /// Records that need writing in a per-record store: added and modified.
    pub fn upserts(&self) -> impl Iterator<Item = &MergedEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.disposition, Disposition::Added | Disposition::Modified))
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.iter().cloned().collect(),
            modified: self.modified.iter().cloned().collect(),
            removed: self.removed.iter().cloned().collect(),
            retained: self.retained.iter().cloned().collect(),
        }
    }
}

/// Counts and key lists emitted before any write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub retained: Vec<String>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} modified={} removed={} retained={}",
            self.added.len(),
            self.modified.len(),
            self.removed.len(),
            self.retained.len()
        )
    }
}

/// Compares `new_records` (fetch order) with `existing` and computes the
/// additions, modifications and removals together with the merged records.
pub fn reconcile(
    new_records: Vec<Record>,
    existing: &StoredCollection,
    policy: &ReconcilePolicy,
) -> Result<DiffResult, ReconcileError> {
    if new_records.is_empty() && !policy.allow_empty {
        return Err(ReconcileError::EmptyResult);
    }

    let mut diff = DiffResult {
        skipped: existing.skipped.clone(),
        ..DiffResult::default()
    };

    let mut order: Vec<String> = Vec::with_capacity(new_records.len());
    let mut index: BTreeMap<String, Record> = BTreeMap::new();
    for record in new_records {
        let key = record.key.clone();
        if index.insert(key.clone(), record).is_some() {
            diff.duplicates.push(key);
        } else {
            order.push(key);
        }
    }

    for key in order {
        let Some(new_record) = index.remove(&key) else {
            continue;
        };
        match existing.get(&key) {
            None => {
                diff.added.insert(key);
                diff.entries.push(MergedEntry {
                    disposition: Disposition::Added,
                    record: new_record,
                });
            }
            Some(stored) => {
                let changes = field_changes(stored, &new_record);
                let merged = merge(stored, new_record);
                let disposition = if changes.is_empty() {
                    Disposition::Unchanged
                } else {
                    diff.modified.insert(key.clone());
                    diff.changes.insert(key, changes);
                    Disposition::Modified
                };
                diff.entries.push(MergedEntry {
                    disposition,
                    record: merged,
                });
            }
        }
    }

    let fetched: BTreeSet<&str> = diff.entries.iter().map(|e| e.record.key.as_str()).collect();
    let mut retained_entries = Vec::new();
    let mut removed = BTreeSet::new();
    for stored in existing.iter() {
        if fetched.contains(stored.key.as_str()) {
            continue;
        }
        let deletable = policy.delete_missing
            && policy
                .provenance_field
                .as_deref()
                .map_or(true, |field| stored.is_externally_sourced(field));
        if deletable {
            removed.insert(stored.key.clone());
        } else {
            diff.retained.insert(stored.key.clone());
            retained_entries.push(MergedEntry {
                disposition: Disposition::Retained,
                record: Record {
                    key: stored.key.clone(),
                    fields: stored.fields.clone(),
                },
            });
        }
    }
    diff.removed = removed;
    diff.entries.extend(retained_entries);

    diff.changed = !diff.added.is_empty() || !diff.modified.is_empty() || !diff.removed.is_empty();
    Ok(diff)
}

/// Fields of `new` that are missing from or differ in `stored`. Fields only
/// the store knows are not changes; they survive the merge.
fn field_changes(stored: &StoredRecord, new: &Record) -> Vec<FieldChange> {
    new.fields
        .iter()
        .filter_map(|(field, value)| match stored.fields.get(field) {
            None => Some(FieldChange::Added {
                field: field.clone(),
                value: value.clone(),
            }),
            Some(old) if old != value => Some(FieldChange::Changed {
                field: field.clone(),
                old: old.clone(),
                new: value.clone(),
            }),
            Some(_) => None,
        })
        .collect()
}

fn merge(stored: &StoredRecord, new: Record) -> Record {
    let mut fields = stored.fields.clone();
    fields.extend(new.fields);
    Record {
        key: new.key,
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact(title: &str, phone: &str) -> Record {
        Record::new(title).with("phone", Some(phone))
    }

    fn stored(records: Vec<Record>) -> StoredCollection {
        StoredCollection::from_records(records.into_iter().map(StoredRecord::from))
    }

    fn after_apply(diff: &DiffResult) -> StoredCollection {
        stored(diff.entries.iter().map(|e| e.record.clone()).collect())
    }

    #[test]
    fn new_contact_is_added_and_existing_one_left_alone() {
        let existing = StoredCollection::from_array(
            Some(&json!([null, {"title": "A", "phone": "+420 111 111 111"}])),
            "title",
        );
        let diff = reconcile(
            vec![contact("A", "+420 111 111 111"), contact("B", "+420 222 222 222")],
            &existing,
            &ReconcilePolicy::default(),
        )
        .unwrap();

        assert_eq!(diff.added, BTreeSet::from(["B".to_string()]));
        assert!(diff.modified.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed);
        assert_eq!(diff.entries.len(), 2);
        assert_eq!(diff.entries[0].disposition, Disposition::Unchanged);
    }

    #[test]
    fn absent_field_in_fetch_keeps_stored_value() {
        let existing = stored(vec![Record::new("k")
            .with("a", Some(1_i64))
            .with("b", Some(2_i64))]);
        let diff = reconcile(
            vec![Record::new("k").with("a", Some(1_i64))],
            &existing,
            &ReconcilePolicy::default(),
        )
        .unwrap();

        assert!(!diff.changed);
        let merged = diff.merged("k").unwrap();
        assert_eq!(merged.get("a"), Some(&FieldValue::Integer(1)));
        assert_eq!(merged.get("b"), Some(&FieldValue::Integer(2)));
    }

    #[test]
    fn differing_value_is_a_modification() {
        let existing = stored(vec![Record::new("k").with("a", Some(1_i64))]);
        let diff = reconcile(
            vec![Record::new("k").with("a", Some(2_i64))],
            &existing,
            &ReconcilePolicy::default(),
        )
        .unwrap();

        assert!(diff.changed);
        assert!(diff.modified.contains("k"));
        assert_eq!(
            diff.changes["k"],
            vec![FieldChange::Changed {
                field: "a".into(),
                old: FieldValue::Integer(1),
                new: FieldValue::Integer(2),
            }]
        );
    }

    #[test]
    fn newly_appearing_field_is_a_modification() {
        let existing = stored(vec![contact("A", "+420 111 111 111")]);
        let diff = reconcile(
            vec![contact("A", "+420 111 111 111").with("mail", Some("a@obec.cz"))],
            &existing,
            &ReconcilePolicy::default(),
        )
        .unwrap();

        assert!(diff.modified.contains("A"));
        assert!(matches!(diff.changes["A"][0], FieldChange::Added { .. }));
    }

    #[test]
    fn rerun_on_merged_store_is_idempotent() {
        let existing = stored(vec![
            contact("A", "+420 111 111 111").with("note", Some("manual edit")),
            contact("C", "+420 333 333 333"),
        ]);
        let fetch = || {
            vec![
                contact("A", "+420 999 999 999"),
                contact("B", "+420 222 222 222"),
            ]
        };
        let first = reconcile(fetch(), &existing, &ReconcilePolicy::default()).unwrap();
        assert!(first.changed);
        assert_eq!(first.removed, BTreeSet::from(["C".to_string()]));

        let second = reconcile(fetch(), &after_apply(&first), &ReconcilePolicy::default()).unwrap();
        assert!(!second.changed);
        assert!(second.summary().is_empty());
        assert_eq!(second.merged("A").unwrap().text("note"), Some("manual edit"));
    }

    #[test]
    fn duplicate_keys_keep_the_last_record_in_first_position() {
        let diff = reconcile(
            vec![
                contact("A", "+420 111 111 111"),
                contact("B", "+420 222 222 222"),
                contact("A", "+420 333 333 333"),
            ],
            &StoredCollection::new(),
            &ReconcilePolicy::default(),
        )
        .unwrap();

        assert_eq!(diff.entries.len(), 2);
        assert_eq!(diff.entries[0].record.text("phone"), Some("+420 333 333 333"));
        assert_eq!(diff.duplicates, vec!["A".to_string()]);
    }

    #[test]
    fn empty_fetch_is_refused_unless_whitelisted() {
        let existing = stored(vec![contact("A", "+420 111 111 111")]);
        assert_eq!(
            reconcile(Vec::new(), &existing, &ReconcilePolicy::default()),
            Err(ReconcileError::EmptyResult)
        );

        let policy = ReconcilePolicy {
            allow_empty: true,
            ..ReconcilePolicy::default()
        };
        let diff = reconcile(Vec::new(), &existing, &policy).unwrap();
        assert!(diff.removed.contains("A"));
    }

    #[test]
    fn manually_added_records_survive_key_disappearance() {
        let existing = stored(vec![
            Record::new("web.pdf").with("fromWebsite", Some(true)),
            Record::new("manual.pdf").with("fromWebsite", Some(false)),
            Record::new("legacy.pdf"),
        ]);
        let policy = ReconcilePolicy {
            provenance_field: Some("fromWebsite".into()),
            ..ReconcilePolicy::default()
        };
        let diff = reconcile(vec![Record::new("new.pdf")], &existing, &policy).unwrap();

        assert_eq!(diff.removed, BTreeSet::from(["web.pdf".to_string()]));
        assert_eq!(
            diff.retained,
            BTreeSet::from(["legacy.pdf".to_string(), "manual.pdf".to_string()])
        );
        assert_eq!(diff.entries.last().unwrap().disposition, Disposition::Retained);
    }

    #[test]
    fn archive_policy_never_removes() {
        let existing = stored(vec![Record::new("202301").with("link", Some("a.pdf"))]);
        let policy = ReconcilePolicy {
            delete_missing: false,
            ..ReconcilePolicy::default()
        };
        let diff = reconcile(
            vec![Record::new("202401").with("link", Some("b.pdf"))],
            &existing,
            &policy,
        )
        .unwrap();
        assert!(diff.removed.is_empty());
        assert!(diff.retained.contains("202301"));
    }

    #[test]
    fn newspaper_link_change_only_touches_the_link() {
        let existing = StoredCollection::from_map(Some(&json!({
            "202401": {"id": 202401, "link": "old.pdf", "year": 2024, "release": 1}
        })));
        let issue = Record::new("202401")
            .with("id", Some(202401_i64))
            .with("link", Some("new.pdf"))
            .with("year", Some(2024_i64))
            .with("release", Some(1_i64));
        let diff = reconcile(vec![issue], &existing, &ReconcilePolicy::default()).unwrap();

        let changes = &diff.changes["202401"];
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field(), "link");
        assert_eq!(changes[0].new_value(), &FieldValue::from("new.pdf"));
    }

    #[test]
    fn malformed_stored_entries_are_reported_not_fatal() {
        let existing = StoredCollection::from_array(
            Some(&json!([null, {"phone": "+420 111 111 111"}, {"title": "A"}])),
            "title",
        );
        let diff = reconcile(
            vec![Record::new("A")],
            &existing,
            &ReconcilePolicy::default(),
        )
        .unwrap();
        assert_eq!(diff.skipped.len(), 1);
        assert!(!diff.changed);
    }
}
