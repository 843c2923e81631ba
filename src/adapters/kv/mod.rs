use async_trait::async_trait;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileKeyValueStore;
pub use memory::InMemoryKeyValueStore;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable string key/value persistence provided by the host.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Stores `value` under `key`. Resolves only once the write is durable.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), KvError>;
}
