//! Realtime document database adapters.
//!
//! Paths are `/`-separated routes (`contact_item/schools`). `update` applies a
//! multi-path patch atomically: either every entry lands or none does.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<JsonValue>, StoreError>;
    async fn set(&self, path: &str, value: &JsonValue) -> Result<(), StoreError>;
    /// Writes every `relative/path -> value` pair under `path`; `null` deletes.
    async fn update(&self, path: &str, patch: &Map<String, JsonValue>) -> Result<(), StoreError>;
}

/// Firebase Realtime Database over its REST interface.
#[derive(Debug, Clone)]
pub struct RealtimeDbStore {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
}

impl RealtimeDbStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, auth: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            auth,
        }
    }

    pub fn url_for(&self, path: &str) -> String {
        let mut url = format!(
            "{}/{}.json",
            self.base_url.trim_end_matches('/'),
            path.trim_matches('/')
        );
        if let Some(auth) = &self.auth {
            url.push_str("?auth=");
            url.push_str(auth);
        }
        url
    }

    async fn check(&self, path: &str, resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(StoreError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            })
        }
    }
}

#[async_trait]
impl DocumentStore for RealtimeDbStore {
    async fn get(&self, path: &str) -> Result<Option<JsonValue>, StoreError> {
        let resp = self.client.get(self.url_for(path)).send().await?;
        let value: JsonValue = self.check(path, resp).await?.json().await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &str, value: &JsonValue) -> Result<(), StoreError> {
        let resp = self.client.put(self.url_for(path)).json(value).send().await?;
        self.check(path, resp).await?;
        Ok(())
    }

    async fn update(&self, path: &str, patch: &Map<String, JsonValue>) -> Result<(), StoreError> {
        let resp = self.client.patch(self.url_for(path)).json(patch).send().await?;
        self.check(path, resp).await?;
        Ok(())
    }
}

/// The whole tree in one local JSON file, replaced through a temp file + rename
/// on every write so a failed write leaves the previous tree intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_tree(&self) -> Result<JsonValue, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(JsonValue::Null),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(JsonValue::Null),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    async fn write_tree(&self, tree: &JsonValue) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(tree)?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|e| self.io_error(e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }
        Ok(())
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn lookup<'a>(tree: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    path.iter().try_fold(tree, |node, segment| match node {
        JsonValue::Object(map) => map.get(*segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Sets `value` at `path`, creating intermediate objects. `null` removes.
fn assign(tree: &mut JsonValue, path: &[&str], value: JsonValue) {
    let Some((last, parents)) = path.split_last() else {
        *tree = value;
        return;
    };
    let mut node = tree;
    for segment in parents {
        if !node.is_object() && !node.is_array() {
            *node = JsonValue::Object(Map::new());
        }
        node = match node {
            JsonValue::Array(items) => match segment.parse::<usize>() {
                Ok(i) => {
                    if items.len() <= i {
                        items.resize(i + 1, JsonValue::Null);
                    }
                    &mut items[i]
                }
                Err(_) => return,
            },
            JsonValue::Object(map) => map
                .entry(segment.to_string())
                .or_insert(JsonValue::Null),
            _ => return,
        };
    }
    if !node.is_object() && !node.is_array() {
        *node = JsonValue::Object(Map::new());
    }
    match node {
        JsonValue::Object(map) => {
            if value.is_null() {
                map.remove(*last);
            } else {
                map.insert(last.to_string(), value);
            }
        }
        JsonValue::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if items.len() <= i {
                    items.resize(i + 1, JsonValue::Null);
                }
                items[i] = value;
            }
        }
        _ => {}
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, path: &str) -> Result<Option<JsonValue>, StoreError> {
        let tree = self.read_tree().await?;
        Ok(lookup(&tree, &segments(path))
            .filter(|v| !v.is_null())
            .cloned())
    }

    async fn set(&self, path: &str, value: &JsonValue) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tree = self.read_tree().await?;
        assign(&mut tree, &segments(path), value.clone());
        self.write_tree(&tree).await
    }

    async fn update(&self, path: &str, patch: &Map<String, JsonValue>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tree = self.read_tree().await?;
        let base = segments(path);
        for (relative, value) in patch {
            let mut full = base.clone();
            full.extend(segments(relative));
            assign(&mut tree, &full, value.clone());
        }
        self.write_tree(&tree).await
    }
}
