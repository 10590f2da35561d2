use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use osync_adapters::{mime_for_extension, ParserKind, ALLOWED_EXTENSIONS};
use osync_core::{
    reconcile, ChangeSummary, DiffResult, FieldValue, ReconcilePolicy, Record, StoredCollection,
};
use osync_storage::{
    ContentSource, DocumentStore, FetcherOptions, HttpFetcher, JsonFileStore, PgRowStore,
    RealtimeDbStore, RowStore, TableSpec,
};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::apply::{
    apply_full_replace, apply_keyed_patch, apply_rows, attach_downloads, format_file_size,
    log_diff, row_plan,
};
use crate::config::{CategoryConfig, ConfigError, Registry, StoreSpec, SyncConfig};
use crate::sinks::{AuditSink, FileSink, Warnings};
use crate::SyncError;

#[derive(Debug)]
pub enum CategoryOutcome {
    Unchanged,
    Applied(ChangeSummary),
    Failed(SyncError),
}

impl CategoryOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<(String, CategoryOutcome)>,
}

impl RunReport {
    /// True when every category was either unchanged or applied.
    pub fn success(&self) -> bool {
        !self.outcomes.iter().any(|(_, outcome)| outcome.is_failure())
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .map(|(name, _)| name.as_str())
    }
}

/// Drives categories one after another against injected backends.
pub struct Runner {
    content: Arc<dyn ContentSource>,
    documents: Option<Arc<dyn DocumentStore>>,
    rows: Option<Arc<dyn RowStore>>,
    log_dir: PathBuf,
}

impl Runner {
    pub fn new(content: Arc<dyn ContentSource>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            content,
            documents: None,
            rows: None,
            log_dir: log_dir.into(),
        }
    }

    pub fn with_documents(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(store);
        self
    }

    pub fn with_rows(mut self, store: Arc<dyn RowStore>) -> Self {
        self.rows = Some(store);
        self
    }

    /// Real backends: HTTP fetcher, a JSON file or the realtime DB, postgres.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetcherOptions {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let documents: Option<Arc<dyn DocumentStore>> =
            match (&config.document_file, &config.document_db_url) {
                (Some(path), _) => Some(Arc::new(JsonFileStore::new(path))),
                (None, Some(url)) => Some(Arc::new(RealtimeDbStore::new(
                    fetcher.client(),
                    url.clone(),
                    config.document_db_auth.clone(),
                ))),
                (None, None) => None,
            };
        let rows: Option<Arc<dyn RowStore>> = match &config.database_url {
            Some(url) => Some(Arc::new(
                PgRowStore::connect_lazy(url).context("configuring postgres pool")?,
            )),
            None => None,
        };

        Ok(Self {
            content: Arc::new(fetcher),
            documents,
            rows,
            log_dir: config.log_dir.clone(),
        })
    }

    /// Every enabled category, in registry order.
    pub async fn run(&self, registry: &Registry) -> Result<RunReport> {
        let categories: Vec<_> = registry.enabled().collect();
        self.run_categories(&categories).await
    }

    /// A single category, enabled or not.
    pub async fn run_only(&self, registry: &Registry, name: &str) -> Result<RunReport> {
        let Some(category) = registry.get(name) else {
            bail!("unknown category `{name}`");
        };
        self.run_categories(&[category]).await
    }

    async fn run_categories(&self, categories: &[&CategoryConfig]) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, categories = categories.len(), "sync run started");

        let mut outcomes = Vec::with_capacity(categories.len());
        for category in categories {
            let sink = FileSink::open(&self.log_dir, &category.log_name, &category.name).await?;
            let outcome = self
                .run_category(category, &sink)
                .instrument(info_span!("category", name = %category.name))
                .await;
            sink.flush().await?;
            outcomes.push((category.name.clone(), outcome));
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        if report.success() {
            info!(%run_id, "sync run finished");
        } else {
            let failed: Vec<_> = report.failed().collect();
            error!(%run_id, failed = ?failed, "sync run finished with failures");
        }
        Ok(report)
    }

    /// One reconciliation run; every error ends here as a logged outcome.
    pub async fn run_category(
        &self,
        category: &CategoryConfig,
        sink: &dyn AuditSink,
    ) -> CategoryOutcome {
        sink.info("Starting update");
        match self.sync_category(category, sink).await {
            Ok(Some(summary)) => {
                sink.info("Update completed successfully");
                CategoryOutcome::Applied(summary)
            }
            Ok(None) => {
                sink.info("No changes detected");
                CategoryOutcome::Unchanged
            }
            Err(err) => {
                sink.error(&format!("Update failed: {err}"));
                CategoryOutcome::Failed(err)
            }
        }
    }

    async fn sync_category(
        &self,
        category: &CategoryConfig,
        sink: &dyn AuditSink,
    ) -> Result<Option<ChangeSummary>, SyncError> {
        let raw = self
            .content
            .fetch(&category.endpoint, category.parser.content_kind())
            .await?;
        let mut records = category
            .parser
            .parse(&raw, &category.endpoint, &Warnings(sink))?;
        sink.info(&format!("Parsed {} records", records.len()));
        if category.parser == ParserKind::Documents {
            records = self.probe_documents(records, sink).await;
        }

        let policy = category.policy();
        let diff = match &category.store {
            StoreSpec::FullReplace { path, .. } => {
                let store = self.documents(category)?;
                let key_field = category.key_field();
                let stored = store.get(path).await?;
                let existing = StoredCollection::from_array(stored.as_ref(), key_field);
                let diff = reconcile(records, &existing, &policy)?;
                log_diff(&diff, sink);
                apply_full_replace(store, path, key_field, &diff).await?;
                diff
            }
            StoreSpec::KeyedPatch { path } => {
                let store = self.documents(category)?;
                let stored = store.get(path).await?;
                let existing = StoredCollection::from_map(stored.as_ref());
                let diff = reconcile(records, &existing, &policy)?;
                log_diff(&diff, sink);
                apply_keyed_patch(store, path, &diff).await?;
                diff
            }
            StoreSpec::Rows(table) => {
                let store = self.rows(category)?;
                self.sync_rows(category, &policy, table, store, records, sink)
                    .await?
            }
        };

        Ok(diff.changed.then(|| diff.summary()))
    }

    async fn sync_rows(
        &self,
        category: &CategoryConfig,
        policy: &ReconcilePolicy,
        table: &TableSpec,
        store: &dyn RowStore,
        records: Vec<Record>,
        sink: &dyn AuditSink,
    ) -> Result<DiffResult, SyncError> {
        store.ensure_table(table).await?;
        let existing = StoredCollection::from_records(store.load(table).await?);

        let urls: BTreeMap<String, String> = records
            .iter()
            .filter_map(|r| r.text("url").map(|url| (r.key.clone(), url.to_string())))
            .collect();
        let rows = records.iter().map(|r| table.to_row(r)).collect();

        let diff = reconcile(rows, &existing, policy)?;
        log_diff(&diff, sink);

        let mut plan = row_plan(&diff);
        if table.blob_column.is_some() && (!plan.inserts.is_empty() || !plan.updates.is_empty()) {
            let total = attach_downloads(
                &mut plan,
                &urls,
                self.content.as_ref(),
                category.file_size_limit_bytes(),
                sink,
            )
            .await;
            sink.info(&format!("Total data downloaded: {}", format_file_size(total)));
        }
        apply_rows(store, table, &plan).await?;
        Ok(diff)
    }

    /// Adds size and MIME type from a HEAD request; unreachable files are dropped.
    async fn probe_documents(&self, records: Vec<Record>, sink: &dyn AuditSink) -> Vec<Record> {
        let mut probed = Vec::with_capacity(records.len());
        for mut record in records {
            let Some(url) = record.text("url").map(ToString::to_string) else {
                sink.warn(&format!("Skipping {} without a url", record.key));
                continue;
            };
            match self.content.probe(&url).await {
                Ok(probe) => {
                    record.fields.insert(
                        "file_size".to_string(),
                        FieldValue::Integer(probe.size as i64),
                    );
                    let detected = probe.content_type.as_deref().and_then(extension_for_mime);
                    if let Some(extension) = detected {
                        record = record
                            .with("file_type", Some(extension))
                            .with("mime_type", mime_for_extension(extension));
                    }
                    probed.push(record);
                }
                Err(err) => sink.error(&format!("Cannot probe {url}: {err}")),
            }
        }
        probed
    }

    fn documents(&self, category: &CategoryConfig) -> Result<&dyn DocumentStore, SyncError> {
        self.documents
            .as_deref()
            .ok_or_else(|| ConfigError::MissingDocumentStore(category.name.clone()).into())
    }

    fn rows(&self, category: &CategoryConfig) -> Result<&dyn RowStore, SyncError> {
        self.rows
            .as_deref()
            .ok_or_else(|| ConfigError::MissingDatabaseUrl(category.name.clone()).into())
    }
}

/// `application/pdf; charset=binary` -> `pdf`.
fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim();
    ALLOWED_EXTENSIONS
        .into_iter()
        .find(|ext| mime_for_extension(ext) == Some(mime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_map_back_to_extensions() {
        assert_eq!(extension_for_mime("application/pdf"), Some("pdf"));
        assert_eq!(
            extension_for_mime("application/msword; charset=binary"),
            Some("doc")
        );
        assert_eq!(extension_for_mime("text/html"), None);
    }

    #[test]
    fn report_fails_when_any_category_failed() {
        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes: vec![
                ("schools".into(), CategoryOutcome::Unchanged),
                ("pharmacies".into(), CategoryOutcome::Failed(SyncError::EmptyResult)),
            ],
        };
        assert!(!report.success());
        assert_eq!(report.failed().collect::<Vec<_>>(), vec!["pharmacies"]);
    }
}
