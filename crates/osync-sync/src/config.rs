//! Process environment plus the static category registry (`categories.yaml`).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use osync_adapters::ParserKind;
use osync_core::ReconcilePolicy;
use osync_storage::TableSpec;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for one downloaded document unless a category overrides it.
pub const DEFAULT_FILE_SIZE_LIMIT_KB: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub registry_path: PathBuf,
    pub log_dir: PathBuf,
    pub main_log: String,
    pub database_url: Option<String>,
    pub document_db_url: Option<String>,
    pub document_db_auth: Option<String>,
    pub document_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub schedule: String,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = non_empty_var("OSYNC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let within = |path: String| {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                path
            } else {
                workspace_root.join(path)
            }
        };
        Self {
            registry_path: within(
                non_empty_var("OSYNC_REGISTRY").unwrap_or_else(|| "categories.yaml".to_string()),
            ),
            log_dir: within(non_empty_var("OSYNC_LOG_DIR").unwrap_or_else(|| "logs".to_string())),
            main_log: non_empty_var("OSYNC_MAIN_LOG").unwrap_or_else(|| "main.log".to_string()),
            database_url: non_empty_var("DATABASE_URL"),
            document_db_url: non_empty_var("OSYNC_DOCUMENT_DB_URL"),
            document_db_auth: non_empty_var("OSYNC_DOCUMENT_DB_AUTH"),
            document_file: non_empty_var("OSYNC_DOCUMENT_FILE").map(within),
            user_agent: non_empty_var("OSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("osync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: non_empty_var("OSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            schedule: non_empty_var("OSYNC_SCHEDULE").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            workspace_root,
        }
    }

    pub fn main_log_path(&self) -> PathBuf {
        self.log_dir.join(&self.main_log)
    }

    pub fn has_document_store(&self) -> bool {
        self.document_file.is_some() || self.document_db_url.is_some()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read registry {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid registry {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("registry lists no categories")]
    NoCategories,
    #[error("category `{0}` is defined more than once")]
    DuplicateName(String),
    #[error("category `{category}`: endpoint `{endpoint}` must use https://")]
    InsecureEndpoint { category: String, endpoint: String },
    #[error("category `{category}`: log name `{log_name}` must look like `name.log`")]
    InvalidLogName { category: String, log_name: String },
    #[error("category `{category}`: {reason}")]
    IncompleteStore { category: String, reason: String },
    #[error("category `{0}` writes rows but DATABASE_URL is not set")]
    MissingDatabaseUrl(String),
    #[error("category `{0}` writes documents but neither OSYNC_DOCUMENT_FILE nor OSYNC_DOCUMENT_DB_URL is set")]
    MissingDocumentStore(String),
    #[error("invalid schedule `{schedule}`: {reason}")]
    Schedule { schedule: String, reason: String },
}

/// Where and how one category persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StoreSpec {
    /// The whole collection is one array under `path`, slot 0 a `null` sentinel.
    FullReplace {
        path: String,
        #[serde(default)]
        key_field: Option<String>,
    },
    /// Map keyed by record key under `path`, patched field by field.
    KeyedPatch { path: String },
    Rows(TableSpec),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub endpoint: String,
    pub parser: ParserKind,
    pub log_name: String,
    pub store: StoreSpec,
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default = "default_true")]
    pub delete_missing: bool,
    #[serde(default)]
    pub provenance_field: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub file_size_limit_kb: Option<u64>,
}

impl CategoryConfig {
    pub fn policy(&self) -> ReconcilePolicy {
        let provenance_field = self.provenance_field.clone().or_else(|| match &self.store {
            StoreSpec::Rows(table) => table.provenance_column.clone(),
            _ => None,
        });
        ReconcilePolicy {
            provenance_field,
            delete_missing: self.delete_missing,
            allow_empty: self.allow_empty,
        }
    }

    pub fn file_size_limit_bytes(&self) -> u64 {
        self.file_size_limit_kb.unwrap_or(DEFAULT_FILE_SIZE_LIMIT_KB) * 1024
    }

    /// Key field of array-shaped documents.
    pub fn key_field(&self) -> &str {
        match &self.store {
            StoreSpec::FullReplace {
                key_field: Some(field),
                ..
            } => field,
            _ => self.parser.key_field(),
        }
    }

    fn validate_store(&self) -> Result<(), String> {
        match &self.store {
            StoreSpec::FullReplace { path, key_field } => {
                if path.trim().is_empty() {
                    return Err("store path is empty".into());
                }
                if key_field.as_deref().is_some_and(|f| f.trim().is_empty()) {
                    return Err("key field is empty".into());
                }
            }
            StoreSpec::KeyedPatch { path } => {
                if path.trim().is_empty() {
                    return Err("store path is empty".into());
                }
            }
            StoreSpec::Rows(table) => {
                if table.table.trim().is_empty() || table.key_column.trim().is_empty() {
                    return Err("table and key column are required".into());
                }
            }
        }
        if self.parser == ParserKind::Documents {
            match &self.store {
                StoreSpec::Rows(table) if table.blob_column.is_some() => {}
                _ => return Err("documents need a rows store with a blob column".into()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub categories: Vec<CategoryConfig>,
}

fn log_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+\.log$").expect("valid regex"))
}

impl Registry {
    pub fn from_yaml(path: &str, text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: display.clone(),
                source,
            })?;
        Self::from_yaml(&display, &text)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CategoryConfig> {
        self.categories.iter().filter(|c| c.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Startup checks; any failure is fatal before a category runs.
    pub fn validate(&self, config: &SyncConfig) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::NoCategories);
        }
        let mut seen = BTreeSet::new();
        for category in &self.categories {
            if !seen.insert(category.name.as_str()) {
                return Err(ConfigError::DuplicateName(category.name.clone()));
            }
            if !category.endpoint.starts_with("https://") || category.endpoint.len() <= 8 {
                return Err(ConfigError::InsecureEndpoint {
                    category: category.name.clone(),
                    endpoint: category.endpoint.clone(),
                });
            }
            if !log_name_pattern().is_match(&category.log_name) {
                return Err(ConfigError::InvalidLogName {
                    category: category.name.clone(),
                    log_name: category.log_name.clone(),
                });
            }
            category
                .validate_store()
                .map_err(|reason| ConfigError::IncompleteStore {
                    category: category.name.clone(),
                    reason,
                })?;
            if !category.enabled {
                continue;
            }
            match &category.store {
                StoreSpec::Rows(_) if config.database_url.is_none() => {
                    return Err(ConfigError::MissingDatabaseUrl(category.name.clone()));
                }
                StoreSpec::FullReplace { .. } | StoreSpec::KeyedPatch { .. }
                    if !config.has_document_store() =>
                {
                    return Err(ConfigError::MissingDocumentStore(category.name.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
