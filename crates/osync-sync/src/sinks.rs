//! Per-category audit logs.
//!
//! The Runner opens one sink per category and hands it down through parse,
//! reconcile and apply. Every line also goes to `tracing` so the main log
//! carries the same story, tagged with the category name.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use osync_adapters::WarningSink;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::Level;

pub trait AuditSink: Send + Sync {
    fn category(&self) -> &str;
    fn record(&self, level: Level, message: &str);

    fn info(&self, message: &str) {
        self.record(Level::INFO, message);
    }

    fn warn(&self, message: &str) {
        self.record(Level::WARN, message);
    }

    fn error(&self, message: &str) {
        self.record(Level::ERROR, message);
    }
}

fn mirror(category: &str, level: Level, message: &str) {
    if level == Level::ERROR {
        tracing::error!(category, "{message}");
    } else if level == Level::WARN {
        tracing::warn!(category, "{message}");
    } else if level == Level::INFO {
        tracing::info!(category, "{message}");
    } else {
        tracing::debug!(category, "{message}");
    }
}

/// Appends `timestamp - LEVEL - message` lines to `{log_dir}/{log_name}`.
///
/// Parsers report through the synchronous [`AuditSink`] interface, so lines
/// are queued and reach the file on [`FileSink::flush`].
#[derive(Debug)]
pub struct FileSink {
    category: String,
    path: PathBuf,
    pending: Mutex<Vec<String>>,
    file: tokio::sync::Mutex<File>,
}

impl FileSink {
    pub async fn open(log_dir: &Path, log_name: &str, category: &str) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .await
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
        let path = log_dir.join(log_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening log {}", path.display()))?;
        Ok(Self {
            category: category.to_string(),
            path,
            pending: Mutex::new(Vec::new()),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every queued line.
    pub async fn flush(&self) -> Result<()> {
        let lines = self
            .pending
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .map_err(|_| anyhow!("audit queue of {} poisoned", self.path.display()))?;
        if lines.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock().await;
        file.write_all(lines.concat().as_bytes())
            .await
            .with_context(|| format!("writing log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("writing log {}", self.path.display()))
    }
}

impl AuditSink for FileSink {
    fn category(&self) -> &str {
        &self.category
    }

    fn record(&self, level: Level, message: &str) {
        mirror(&self.category, level, message);
        let line = format!(
            "{} - {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            level,
            message
        );
        match self.pending.lock() {
            Ok(mut pending) => pending.push(line),
            Err(_) => tracing::error!(path = %self.path.display(), "audit queue poisoned"),
        }
    }
}

/// Keeps lines in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    category: String,
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn messages_at(&self, level: Level) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, m)| m.contains(needle))
    }
}

impl AuditSink for MemorySink {
    fn category(&self) -> &str {
        &self.category
    }

    fn record(&self, level: Level, message: &str) {
        mirror(&self.category, level, message);
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}

/// Routes validator warnings into an audit sink.
pub struct Warnings<'a>(pub &'a dyn AuditSink);

impl WarningSink for Warnings<'_> {
    fn warn(&self, message: &str) {
        self.0.warn(message);
    }
}
