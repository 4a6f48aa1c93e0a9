//! Table layout for the durable backend.

use rusqlite::Connection;

/// Creates the record table and its indexes if they do not exist yet.
///
/// `table` must already be validated as a plain identifier.
pub(crate) fn ensure(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
             key          TEXT    PRIMARY KEY NOT NULL,
             value        BLOB    NOT NULL,
             is_ttl_based INTEGER NOT NULL DEFAULT 0,
             expires_at   INTEGER,
             ts           INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_{table}_is_ttl_based ON {table}(is_ttl_based);
         CREATE INDEX IF NOT EXISTS idx_{table}_expires_at ON {table}(expires_at);
         CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table}(ts);
         CREATE INDEX IF NOT EXISTS idx_{table}_expiry ON {table}(is_ttl_based, expires_at);"
    ))
}

/// Prepared SQL text for one table.
#[derive(Debug)]
pub(crate) struct Statements {
    pub table: String,
    pub select_live: String,
    pub upsert: String,
    pub insert_if_absent: String,
    pub update_value: String,
    pub update_with_ttl: String,
    pub delete: String,
    pub purge: String,
}

impl Statements {
    pub(crate) fn new(table: &str) -> Self {
        let insert = format!(
            "INSERT INTO {table} (key, value, is_ttl_based, expires_at, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 is_ttl_based = excluded.is_ttl_based,
                 expires_at = excluded.expires_at,
                 ts = excluded.ts"
        );
        let live = "(is_ttl_based = 0 OR expires_at > ?4)";

        Self {
            table: table.to_string(),
            select_live: format!(
                "SELECT key, value, is_ttl_based, expires_at, ts FROM {table}
                 WHERE key = ?1 AND (is_ttl_based = 0 OR expires_at > ?2)"
            ),
            insert_if_absent: format!(
                "{insert}
                 WHERE {table}.is_ttl_based = 1 AND {table}.expires_at <= ?6"
            ),
            upsert: insert,
            update_value: format!(
                "UPDATE {table} SET value = ?2, ts = ?3 WHERE key = ?1 AND {live}"
            ),
            update_with_ttl: format!(
                "UPDATE {table} SET value = ?2, ts = ?3, is_ttl_based = 1, expires_at = ?5
                 WHERE key = ?1 AND {live}"
            ),
            delete: format!("DELETE FROM {table} WHERE key = ?1"),
            purge: format!("DELETE FROM {table} WHERE is_ttl_based = 1 AND expires_at <= ?1"),
        }
    }

    pub(crate) fn count(&self, where_clause: &str) -> String {
        format!("SELECT COUNT(*) FROM {} WHERE {where_clause}", self.table)
    }

    pub(crate) fn page(&self, where_clause: &str) -> String {
        format!(
            "SELECT key, value, is_ttl_based, expires_at, ts FROM {} WHERE {where_clause}
             ORDER BY ts DESC, key ASC LIMIT ? OFFSET ?",
            self.table
        )
    }
}
