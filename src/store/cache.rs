//! Cache backend built on moka.
//!
//! Expiry is native: every entry carries its own deadline and a per-entry
//! [`Expiry`] policy tells moka when to drop it, so no sweeper runs for this
//! provider. Reads still check the deadline themselves because moka evicts
//! lazily and a just-elapsed entry can be observed for a short window.
//!
//! Conditional writes (`update`, `insert`) go through moka's entry compute
//! API, which serializes concurrent computations on the same key.

use super::backend::{StoreBackend, validate_key};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::record::{Entry, Metadata, Record, now};
use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use moka::Expiry;
use moka::ops::compute::Op;
use moka::sync::Cache as MokaCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Engines opened by name, so handles to the same target share data.
static ENGINES: LazyLock<Mutex<HashMap<String, CacheEngine>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

type CacheKey = (u16, String);

/// A record plus the monotonic instant it stops being visible.
#[derive(Debug)]
struct CacheEntry {
    record: Record,
    deadline: Option<Instant>,
}

impl CacheEntry {
    fn new(record: Record, ttl: Option<Duration>) -> Arc<Self> {
        let deadline = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        Arc::new(Self { record, deadline })
    }

    fn is_live_at(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| deadline > now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

/// Tells moka to expire each entry at its own deadline.
struct CacheExpiry;

impl Expiry<CacheKey, Arc<CacheEntry>> for CacheExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<CacheEntry>,
        created_at: Instant,
    ) -> Option<Duration> {
        value.remaining(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Arc<CacheEntry>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining(updated_at)
    }
}

/// A named in-process cache engine.
///
/// Cloning is cheap; clones share the same entries. Backends attach to an
/// engine with a namespace index and never see each other's keys.
#[derive(Clone)]
pub struct CacheEngine {
    name: Arc<str>,
    entries: MokaCache<CacheKey, Arc<CacheEntry>>,
}

impl CacheEngine {
    /// Creates a standalone engine.
    ///
    /// With `max_capacity` unset the engine never evicts by size, so entries
    /// leave only when deleted or when their TTL elapses.
    pub fn new(name: &str, max_capacity: Option<u64>) -> Self {
        let mut builder = MokaCache::builder().name(name).expire_after(CacheExpiry);
        if let Some(limit) = max_capacity {
            builder = builder.max_capacity(limit);
        }
        let entries = builder.build();

        Self {
            name: Arc::from(name),
            entries,
        }
    }

    /// Returns the process-wide engine registered under `name`, creating it
    /// on first use. `max_capacity` only applies when the engine is created.
    pub fn shared(name: &str, max_capacity: Option<u64>) -> Self {
        ENGINES
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Self::new(name, max_capacity))
            .clone()
    }

    /// Removes the engine registered under `name` from the process registry.
    ///
    /// Handles already attached keep their entries until dropped; the next
    /// [`shared`](Self::shared) call with this name starts an empty engine.
    /// Returns whether an engine was registered.
    pub fn drop_shared(name: &str) -> bool {
        let removed = ENGINES.lock().remove(name).is_some();
        if removed {
            debug!(engine = %name, "Cache engine released");
        }
        removed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries currently held, including ones pending eviction.
    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

/// Cache-backed store with native per-key expiry.
pub struct CacheBackend {
    engine: RwLock<Option<CacheEngine>>,
    namespace: u16,
}

impl CacheBackend {
    /// Attaches to the shared engine named in `config`.
    pub fn connect(config: &CacheConfig) -> Self {
        let engine = CacheEngine::shared(&config.name, config.max_capacity);
        info!(
            engine = %config.name,
            namespace = config.namespace,
            "Cache store connected"
        );
        Self::with_engine(engine, config.namespace)
    }

    /// Attaches to an existing engine under the given namespace.
    pub fn with_engine(engine: CacheEngine, namespace: u16) -> Self {
        Self {
            engine: RwLock::new(Some(engine)),
            namespace,
        }
    }

    /// A private engine with default capacity, for tests and embedding.
    pub fn memory() -> Self {
        let defaults = CacheConfig::default();
        Self::with_engine(CacheEngine::new("memory", defaults.max_capacity), 0)
    }

    fn entries(&self) -> Result<MokaCache<CacheKey, Arc<CacheEntry>>> {
        self.engine
            .read()
            .as_ref()
            .map(|engine| engine.entries.clone())
            .ok_or(Error::Closed)
    }

    fn cache_key(&self, key: &str) -> CacheKey {
        (self.namespace, key.to_string())
    }

    fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let record = match ttl {
            Some(ttl) => Record::with_ttl(key, value, ttl)?,
            None => Record::new(key, value),
        };
        self.entries()?
            .insert(self.cache_key(key), CacheEntry::new(record, ttl));
        Ok(())
    }

    /// Replaces a live entry. `ttl` of `None` keeps the current deadline.
    fn replace(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let mut record = match ttl {
            Some(ttl) => Record::with_ttl(key, value, ttl)?,
            None => Record::new(key, value),
        };
        let mut found = false;
        let now = Instant::now();

        self.entries()?
            .entry(self.cache_key(key))
            .and_compute_with(|current| match current {
                Some(current) if current.value().is_live_at(now) => {
                    found = true;
                    if ttl.is_some() {
                        return Op::Put(CacheEntry::new(record, ttl));
                    }
                    let current = current.into_value();
                    record.is_ttl_based = current.record.is_ttl_based;
                    record.expires_at = current.record.expires_at;
                    Op::Put(Arc::new(CacheEntry {
                        record,
                        deadline: current.deadline,
                    }))
                },
                _ => Op::Nop,
            });

        if found {
            Ok(())
        } else {
            Err(Error::key_not_found(key))
        }
    }

    /// Writes an entry unless a live one exists.
    fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let record = match ttl {
            Some(ttl) => Record::with_ttl(key, value, ttl)?,
            None => Record::new(key, value),
        };
        let mut exists = false;
        let now = Instant::now();

        self.entries()?
            .entry(self.cache_key(key))
            .and_compute_with(|current| match current {
                Some(current) if current.value().is_live_at(now) => {
                    exists = true;
                    Op::Nop
                },
                _ => Op::Put(CacheEntry::new(record, ttl)),
            });

        if exists {
            Err(Error::key_already_exists(key))
        } else {
            Ok(())
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

#[async_trait]
impl StoreBackend for CacheBackend {
    fn provider(&self) -> &'static str {
        "cache"
    }

    async fn get(&self, key: &str) -> Result<Entry> {
        validate_key(key)?;
        let now_instant = Instant::now();
        let entry = self
            .entries()?
            .get(&self.cache_key(key))
            .filter(|entry| entry.is_live_at(now_instant))
            .ok_or_else(|| Error::key_not_found(key))?;

        let expires_at = entry.remaining(now_instant).and_then(|remaining| {
            chrono::Duration::from_std(remaining)
                .ok()
                .and_then(|remaining| now().checked_add_signed(remaining))
        });

        Ok(Entry {
            value: entry.record.value.clone(),
            metadata: Metadata {
                created_at: entry.record.timestamp.with_timezone(&utc()),
                expires_at: expires_at.map(|exp| exp.with_timezone(&utc())),
            },
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.put(key, value, None)
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.put(key, value, Some(ttl))
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.replace(key, value, None)
    }

    async fn update_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.replace(key, value, Some(ttl))
    }

    async fn insert(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.put_if_absent(key, value, None)
    }

    async fn insert_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.put_if_absent(key, value, Some(ttl))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let now = Instant::now();
        match self.entries()?.remove(&self.cache_key(key)) {
            Some(entry) if entry.is_live_at(now) => Ok(()),
            _ => Err(Error::key_not_found(key)),
        }
    }

    /// Detaches this handle. A named engine and its entries stay registered
    /// for the life of the process until [`CacheEngine::drop_shared`] is called.
    async fn close(&self) -> Result<()> {
        if let Some(engine) = self.engine.write().take() {
            debug!(engine = %engine.name(), namespace = self.namespace, "Cache store closed");
        }
        Ok(())
    }
}
