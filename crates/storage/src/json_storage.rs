//! JSON file store.
//!
//! Keeps every key in a single JSON object on disk. The file is read once on
//! open and rewritten after each change through a temporary file and rename,
//! so a crash mid-write leaves the previous contents intact.

use super::{Result, Store, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// File-backed store.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open the store at `path`, creating parent directories as needed.
    /// A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let items = read_items(&path).await?;
        debug!(path = %path.display(), keys = items.len(), "opened store");

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, items: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock().await;
        items.insert(key.to_string(), value.to_string());
        self.flush(&items).await
    }

    async fn remove_item(&self, key: &str) -> Result<bool> {
        let mut items = self.items.lock().await;
        let existed = items.remove(key).is_some();
        if existed {
            self.flush(&items).await?;
        }
        Ok(existed)
    }

    async fn clear(&self) -> Result<()> {
        let mut items = self.items.lock().await;
        items.clear();
        self.flush(&items).await
    }

    async fn key(&self, index: usize) -> Result<Option<String>> {
        Ok(self.items.lock().await.keys().nth(index).cloned())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}

async fn read_items(path: &Path) -> Result<BTreeMap<String, String>> {
    let json = match fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<serde_json::Value>(&json)? {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()),
        _ => Err(StoreError::NotAnObject(path.display().to_string())),
    }
}
