//! Uniform key-value store with pluggable engines.
//!
//! Two providers implement the same contract:
//!
//! - **durable**: embedded SQLite with an active TTL sweeper and pattern queries
//! - **cache**: in-process moka cache with native per-key expiry
//!
//! The provider is chosen once when the [`Store`] is constructed.
//!
//! # Example
//!
//! ```no_run
//! use duokv::{DurableConfig, Store};
//! use std::time::Duration;
//!
//! # async fn run() -> duokv::Result<()> {
//! let store = Store::durable(&DurableConfig::at("/var/lib/duokv")).await?;
//! store.set_with_ttl("session/abc", b"token", Duration::from_secs(2)).await?;
//! let entry = store.get("session/abc").await?;
//! assert_eq!(entry.value, b"token");
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod cache;
pub mod durable;

pub use backend::StoreBackend;
pub use cache::{CacheBackend, CacheEngine};
pub use durable::{DurableBackend, SweeperState};

use crate::config::{BackendConfig, CacheConfig, DurableConfig, Provider, StoreConfig};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::record::{Entry, QueryPage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Handle to an open store.
///
/// `Store` is `Clone`; clones share the same backend. Closing any clone
/// closes the backend for all of them.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    provider: Provider,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("provider", &self.provider)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens a store by provider name with that provider's options table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] for an unknown provider,
    /// [`Error::Validation`] for malformed options, and
    /// [`Error::Connection`] if the engine cannot be initialized.
    pub async fn open(provider: &str, options: toml::Table) -> Result<Self> {
        Self::connect(&BackendConfig::from_table(provider, options)?).await
    }

    /// Opens a store from a typed backend configuration.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn connect(config: &BackendConfig) -> Result<Self> {
        let report = config.validate()?;
        for warning in &report.warnings {
            warn!("{warning}");
        }

        let backend: Arc<dyn StoreBackend> = match config {
            BackendConfig::Durable(c) => Arc::new(DurableBackend::open(c).await?),
            BackendConfig::Cache(c) => Arc::new(CacheBackend::connect(c)),
        };

        Ok(Self {
            backend,
            provider: config.provider(),
            timeout: None,
        })
    }

    /// Opens the store described by a loaded configuration file, applying
    /// its default operation timeout.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let store = Self::connect(&config.backend()?).await?;
        Ok(match config.operation_timeout() {
            Some(timeout) => store.with_timeout(timeout),
            None => store,
        })
    }

    /// Opens a durable store.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn durable(config: &DurableConfig) -> Result<Self> {
        Self::connect(&BackendConfig::Durable(config.clone())).await
    }

    /// Opens a cache store.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid settings.
    pub async fn cache(config: &CacheConfig) -> Result<Self> {
        Self::connect(&BackendConfig::Cache(config.clone())).await
    }

    /// Returns a handle whose calls fail with [`Error::Timeout`] after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Applies the per-call deadline, if any.
    async fn call<T>(
        &self,
        operation: &'static str,
        key: Option<&str>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::timeout(
                    operation,
                    key,
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                )
            })?,
            None => fut.await,
        }
    }

    /// Retrieves a live record's value and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent or expired.
    pub async fn get(&self, key: &str) -> Result<Entry> {
        self.call("get", Some(key), self.backend.get(key)).await
    }

    /// Upserts a record without expiration.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the engine fails.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.call("set", Some(key), self.backend.set(key, value.to_vec()))
            .await
    }

    /// Upserts a record that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or TTL is invalid or the engine fails.
    pub async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.call(
            "set_with_ttl",
            Some(key),
            self.backend.set_with_ttl(key, value.to_vec(), ttl),
        )
        .await
    }

    /// Replaces a live record's value, keeping its TTL state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no live record exists.
    pub async fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        self.call("update", Some(key), self.backend.update(key, value.to_vec()))
            .await
    }

    /// Replaces a live record's value and (re)installs a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no live record exists.
    pub async fn update_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.call(
            "update_with_ttl",
            Some(key),
            self.backend.update_with_ttl(key, value.to_vec(), ttl),
        )
        .await
    }

    /// Writes a record only if no live record exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyAlreadyExists`] if a live record is present.
    pub async fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        self.call("insert", Some(key), self.backend.insert(key, value.to_vec()))
            .await
    }

    /// Insert-only write with a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyAlreadyExists`] if a live record is present.
    pub async fn insert_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.call(
            "insert_with_ttl",
            Some(key),
            self.backend.insert_with_ttl(key, value.to_vec(), ttl),
        )
        .await
    }

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if nothing was stored under the key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.call("delete", Some(key), self.backend.delete(key)).await
    }

    /// Runs a pattern query. Only the durable provider supports queries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] on the cache provider and
    /// [`Error::Validation`] for an empty pattern.
    pub async fn query(&self, query: &Query) -> Result<QueryPage> {
        self.call("query", None, self.backend.query(query)).await
    }

    /// Stops background work and releases the engine. Idempotent.
    ///
    /// Not bounded by the per-call deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to close cleanly.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}
