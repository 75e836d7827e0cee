//! Cache store backends keyed by the opaque strings from [`crate::key`].

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::time::Duration;

use thiserror::Error;

/// Longest TTL a store honours; anything longer is treated as this.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Fetch-or-populate storage for rendered region output.
///
/// Implementations must be safe to share between concurrent render passes.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Drop every entry.
    fn clear(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<S: CacheStore + ?Sized> CacheStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}
