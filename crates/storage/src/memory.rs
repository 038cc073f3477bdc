//! In-process store.

use super::{Result, Store};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Store that lives for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<bool> {
        Ok(self.items.lock().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.items.lock().await.clear();
        Ok(())
    }

    async fn key(&self, index: usize) -> Result<Option<String>> {
        Ok(self.items.lock().await.keys().nth(index).cloned())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}
