//! Durable backend on embedded SQLite.
//!
//! Records live in one table keyed by `key`. Every write is a single
//! statement (an `INSERT ... ON CONFLICT` upsert or a guarded `UPDATE`), so
//! same-key writers are serialized by the engine and the last commit wins.
//!
//! Expired rows are filtered out of every read and removed in bulk by a
//! [`TtlSweeper`] owned by the backend.

mod schema;
pub mod sweeper;

#[cfg(test)]
mod tests;

use super::backend::{StoreBackend, validate_key};
use crate::config::DurableConfig;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::record::{
    Entry, QueryItem, QueryPage, Record, expiry_from, from_micros, now, to_micros,
};
use async_trait::async_trait;
use chrono::FixedOffset;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use schema::Statements;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub use sweeper::{Purge, SweeperState, TtlSweeper};

/// Raw column tuple as read from the record table.
type RecordRow = (String, Vec<u8>, bool, Option<i64>, i64);

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_record((key, value, is_ttl_based, expires_at, ts): RecordRow) -> Result<Record> {
    Ok(Record {
        key,
        value,
        is_ttl_based,
        expires_at: expires_at.map(from_micros).transpose()?,
        timestamp: from_micros(ts)?,
    })
}

struct Inner {
    conn: Mutex<Option<Connection>>,
    sql: Statements,
    tz: FixedOffset,
}

/// Cheap handle shared between the backend and its sweeper task.
#[derive(Clone)]
struct Shared(Arc<Inner>);

impl Shared {
    /// Runs `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, key: Option<&str>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Statements) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || {
            let guard = inner.conn.lock();
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            f(conn, &inner.sql)
        })
        .await
        .map_err(|e| Error::connection(operation, key, e))?
    }

    async fn write(
        &self,
        operation: &'static str,
        key: &str,
        record: Record,
        insert_only: bool,
    ) -> Result<()> {
        validate_key(key)?;
        let owned = key.to_string();
        let written = self
            .blocking(operation, Some(key), move |conn, sql| {
                let fail =
                    |e: rusqlite::Error| Error::connection(operation, Some(owned.as_str()), e);
                let expires_at = record.expires_at.map(to_micros);
                let ts = to_micros(record.timestamp);
                if insert_only {
                    conn.prepare_cached(&sql.insert_if_absent)
                        .and_then(|mut stmt| {
                            stmt.execute(params![
                                owned,
                                record.value,
                                record.is_ttl_based,
                                expires_at,
                                ts,
                                to_micros(now()),
                            ])
                        })
                        .map_err(fail)
                } else {
                    conn.prepare_cached(&sql.upsert)
                        .and_then(|mut stmt| {
                            stmt.execute(params![
                                owned,
                                record.value,
                                record.is_ttl_based,
                                expires_at,
                                ts,
                            ])
                        })
                        .map_err(fail)
                }
            })
            .await?;

        if written == 0 {
            return Err(Error::key_already_exists(key));
        }
        debug!(key = %key, operation, "Record written");
        Ok(())
    }

    async fn update(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let ts = now();
        let expires_at = ttl.map(|ttl| expiry_from(ts, ttl)).transpose()?;
        let operation = if ttl.is_some() { "update_with_ttl" } else { "update" };
        let owned = key.to_string();

        let updated = self
            .blocking(operation, Some(key), move |conn, sql| {
                let fail =
                    |e: rusqlite::Error| Error::connection(operation, Some(owned.as_str()), e);
                let (ts, live_at) = (to_micros(ts), to_micros(now()));
                match expires_at {
                    Some(exp) => conn
                        .prepare_cached(&sql.update_with_ttl)
                        .and_then(|mut stmt| {
                            stmt.execute(params![owned, value, ts, live_at, to_micros(exp)])
                        })
                        .map_err(fail),
                    None => conn
                        .prepare_cached(&sql.update_value)
                        .and_then(|mut stmt| stmt.execute(params![owned, value, ts, live_at]))
                        .map_err(fail),
                }
            })
            .await?;

        if updated == 0 {
            return Err(Error::key_not_found(key));
        }
        Ok(())
    }
}

#[async_trait]
impl Purge for Shared {
    async fn purge_expired(&self) -> Result<u64> {
        self.blocking("sweep", None, |conn, sql| {
            let removed = conn
                .prepare_cached(&sql.purge)
                .and_then(|mut stmt| stmt.execute(params![to_micros(now())]))
                .map_err(|e| Error::connection("sweep", None, e))?;
            Ok(removed as u64)
        })
        .await
    }
}

/// SQLite-backed store with an active TTL sweeper.
pub struct DurableBackend {
    shared: Shared,
    sweeper: tokio::sync::Mutex<Option<TtlSweeper>>,
}

impl DurableBackend {
    /// Opens the database described by `config` and starts the sweeper at the
    /// configured interval.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid settings and a connection
    /// error if the database cannot be opened or initialized.
    pub async fn open(config: &DurableConfig) -> Result<Self> {
        Self::open_with_sweep_interval(config, config.sweep_interval()).await
    }

    /// Like [`open`](Self::open), with an explicit sweep interval.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn open_with_sweep_interval(
        config: &DurableConfig,
        interval: Duration,
    ) -> Result<Self> {
        config.validate()?;
        if interval.is_zero() {
            return Err(Error::validation(
                "sweep_interval_secs",
                "must be greater than zero",
            ));
        }
        let tz = config.offset()?;

        let opened = config.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&opened))
            .await
            .map_err(|e| Error::connection("connect", None, e))??;

        let target = if config.is_in_memory() {
            config.data_dir.clone()
        } else {
            config.database_path()
        };
        info!(
            database = %target.display(),
            table = %config.table_name,
            "Durable store opened"
        );

        let shared = Shared(Arc::new(Inner {
            conn: Mutex::new(Some(conn)),
            sql: Statements::new(&config.table_name),
            tz,
        }));
        let sweeper = TtlSweeper::start(Arc::new(shared.clone()), interval);

        Ok(Self {
            shared,
            sweeper: tokio::sync::Mutex::new(Some(sweeper)),
        })
    }

    /// Deletes every expired record now, outside the sweeper schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the delete fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.shared.purge_expired().await
    }

    /// Number of stored rows, including expired rows not yet swept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the count fails.
    pub async fn row_count(&self) -> Result<u64> {
        self.shared
            .blocking("count", None, |conn, sql| {
                let count: i64 = conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", sql.table), [], |row| {
                        row.get(0)
                    })
                    .map_err(|e| Error::connection("count", None, e))?;
                Ok(count as u64)
            })
            .await
    }

    /// State of the sweeper, or `None` once the store is closed.
    pub async fn sweeper_state(&self) -> Option<SweeperState> {
        self.sweeper.lock().await.as_ref().map(TtlSweeper::state)
    }
}

fn open_connection(config: &DurableConfig) -> Result<Connection> {
    let connect = |e: rusqlite::Error| Error::connection("connect", None, e);

    let conn = if config.is_in_memory() {
        Connection::open_in_memory().map_err(connect)?
    } else {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::connection("connect", None, e))?;
        Connection::open(config.database_path()).map_err(connect)?
    };

    conn.busy_timeout(config.busy_timeout()).map_err(connect)?;
    conn.execute_batch("PRAGMA case_sensitive_like = ON;")
        .map_err(connect)?;
    schema::ensure(&conn, &config.table_name).map_err(connect)?;

    Ok(conn)
}

#[async_trait]
impl StoreBackend for DurableBackend {
    fn provider(&self) -> &'static str {
        "durable"
    }

    async fn get(&self, key: &str) -> Result<Entry> {
        validate_key(key)?;
        let owned = key.to_string();
        let row = self
            .shared
            .blocking("get", Some(key), move |conn, sql| {
                conn.prepare_cached(&sql.select_live)
                    .and_then(|mut stmt| {
                        stmt.query_row(params![owned, to_micros(now())], record_from_row)
                            .optional()
                    })
                    .map_err(|e| Error::connection("get", Some(owned.as_str()), e))
            })
            .await?;

        let record = into_record(row.ok_or_else(|| Error::key_not_found(key))?)?;
        Ok(Entry {
            metadata: record.metadata(&self.shared.0.tz),
            value: record.value,
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.shared
            .write("set", key, Record::new(key, value), false)
            .await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let record = Record::with_ttl(key, value, ttl)?;
        self.shared.write("set_with_ttl", key, record, false).await
    }

    async fn update(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.shared.update(key, value, None).await
    }

    async fn update_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.shared.update(key, value, Some(ttl)).await
    }

    async fn insert(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.shared
            .write("insert", key, Record::new(key, value), true)
            .await
    }

    async fn insert_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let record = Record::with_ttl(key, value, ttl)?;
        self.shared.write("insert_with_ttl", key, record, true).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let owned = key.to_string();
        let removed = self
            .shared
            .blocking("delete", Some(key), move |conn, sql| {
                conn.prepare_cached(&sql.delete)
                    .and_then(|mut stmt| stmt.execute(params![owned]))
                    .map_err(|e| Error::connection("delete", Some(owned.as_str()), e))
            })
            .await?;

        if removed == 0 {
            return Err(Error::key_not_found(key));
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<QueryPage> {
        let plan = query.to_sql(now())?;
        let (rows, total) = self
            .shared
            .blocking("query", None, move |conn, sql| {
                let fail = |e: rusqlite::Error| Error::connection("query", None, e);
                let tx = conn.unchecked_transaction().map_err(fail)?;

                let total: i64 = tx
                    .query_row(
                        &sql.count(&plan.where_clause),
                        params_from_iter(plan.params.iter()),
                        |row| row.get(0),
                    )
                    .map_err(fail)?;

                let rows = {
                    let mut stmt = tx.prepare(&sql.page(&plan.where_clause)).map_err(fail)?;
                    let bound = plan
                        .params
                        .iter()
                        .cloned()
                        .chain([plan.limit.into(), plan.offset.into()]);
                    stmt.query_map(params_from_iter(bound), record_from_row)
                        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                        .map_err(fail)?
                };

                tx.commit().map_err(fail)?;
                Ok((rows, total))
            })
            .await?;

        let items = rows
            .into_iter()
            .map(|row| {
                let record = into_record(row)?;
                Ok(QueryItem {
                    metadata: record.metadata(&self.shared.0.tz),
                    key: record.key,
                    data: record.value,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryPage {
            items,
            total: total as u64,
        })
    }

    async fn close(&self) -> Result<()> {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(mut sweeper) = sweeper {
            sweeper.shutdown().await;
        }

        let conn = self.shared.0.conn.lock().take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| Error::connection("close", None, e))?;
            debug!(table = %self.shared.0.sql.table, "Durable store closed");
        }
        Ok(())
    }
}
