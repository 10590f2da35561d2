//! Category registry, audit sinks, apply strategies and the Runner that drives
//! fetch, parse, reconcile and apply for every configured category.

use osync_adapters::ParseError;
use osync_core::ReconcileError;
use osync_storage::{FetchError, StoreError};
use thiserror::Error;

pub mod apply;
pub mod config;
pub mod runner;
pub mod scheduler;
pub mod sinks;

pub use config::{CategoryConfig, ConfigError, Registry, StoreSpec, SyncConfig};
pub use runner::{CategoryOutcome, RunReport, Runner};
pub use scheduler::build_scheduler;
pub use sinks::{AuditSink, FileSink, MemorySink, Warnings};

pub const CRATE_NAME: &str = "osync-sync";

/// Why one category did not reconcile.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("no records parsed; the store was left untouched")]
    EmptyResult,
    #[error("store failed: {0}")]
    Apply(#[from] StoreError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<ReconcileError> for SyncError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::EmptyResult => Self::EmptyResult,
        }
    }
}
