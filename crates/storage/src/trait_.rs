//! Key/value store abstraction.

use async_trait::async_trait;

/// Error type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backing file does not hold a JSON object
    #[error("{0} does not contain a JSON object")]
    NotAnObject(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// String key/value store with a stable key order.
///
/// Shared between tasks behind an `Arc`, so every operation takes `&self`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a value.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Returns whether it existed.
    async fn remove_item(&self, key: &str) -> Result<bool>;

    /// Delete everything.
    async fn clear(&self) -> Result<()>;

    /// Name of the `index`-th key.
    async fn key(&self, index: usize) -> Result<Option<String>>;

    /// Number of stored keys.
    async fn len(&self) -> Result<usize>;
}
