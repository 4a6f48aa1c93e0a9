//! Backend trait for the store.
//!
//! Defines the uniform contract every storage engine implements, so the
//! [`Store`](super::Store) facade can dispatch without knowing which engine
//! sits underneath.

use crate::error::{Error, Result};
use crate::query::Query;
use crate::record::{Entry, QueryPage};
use async_trait::async_trait;
use std::time::Duration;

/// Backend trait for key-value storage with TTL expiry.
///
/// All backends must be thread-safe (`Send + Sync`) for use with tokio.
/// Each write is a single atomic operation on one key; reads never return
/// a record whose TTL has elapsed, even if the engine has not removed it yet.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Provider name used in errors and logs.
    fn provider(&self) -> &'static str;

    /// Retrieves the value and metadata of a live record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Entry>;

    /// Upserts a record without expiration, clearing any previous TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the engine rejects the write.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Upserts a record that expires `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or TTL is invalid or the engine rejects
    /// the write.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Replaces the value of a live record, keeping its TTL state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no live record exists.
    async fn update(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Replaces the value of a live record and (re)installs a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no live record exists.
    async fn update_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Writes a record only if no live record exists for the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyAlreadyExists`] if a live record is present.
    async fn insert(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Insert-only write with a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyAlreadyExists`] if a live record is present.
    async fn insert_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if nothing was stored under the key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Runs a pattern query.
    ///
    /// The default implementation reports the operation as unsupported;
    /// engines without a secondary index leave it in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] unless the backend overrides it.
    async fn query(&self, query: &Query) -> Result<QueryPage> {
        let _ = query;
        Err(Error::Unsupported {
            operation: "query",
            provider: self.provider(),
        })
    }

    /// Releases engine resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if background work could not be shut down cleanly.
    async fn close(&self) -> Result<()>;
}

/// Rejects keys the contract does not allow.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("key", "must not be empty"));
    }
    Ok(())
}
