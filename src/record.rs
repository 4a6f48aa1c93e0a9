//! Record model shared by all backends.
//!
//! A [`Record`] is the canonical form of one stored entry. Backends convert
//! their engine rows into records and render [`Metadata`] from them, so both
//! providers return the same response shape.

use crate::error::{Error, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::time::Duration;

/// One stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Unique key within a backend namespace.
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// True iff the record is subject to expiration.
    pub is_ttl_based: bool,
    /// Expiry instant; only meaningful when `is_ttl_based` is set.
    pub expires_at: Option<DateTime<Utc>>,
    /// Time of the last write.
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Creates a record without expiration, stamped with the current time.
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            is_ttl_based: false,
            expires_at: None,
            timestamp: now(),
        }
    }

    /// Creates a record that expires `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `ttl` is zero or too large to represent.
    pub fn with_ttl(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Result<Self> {
        let mut record = Self::new(key, value);
        record.expires_at = Some(expiry_from(record.timestamp, ttl)?);
        record.is_ttl_based = true;
        Ok(record)
    }

    /// Returns true if the record is logically absent at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_ttl_based && self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Returns true if the record is logically absent right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }

    /// Renders caller-facing metadata in the given timezone.
    pub fn metadata(&self, tz: &FixedOffset) -> Metadata {
        Metadata {
            created_at: self.timestamp.with_timezone(tz),
            expires_at: self
                .expires_at
                .filter(|_| self.is_ttl_based)
                .map(|exp| exp.with_timezone(tz)),
        }
    }
}

/// Current time truncated to the microsecond precision used in storage.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Computes `from + ttl`, rejecting zero and unrepresentable durations.
pub(crate) fn expiry_from(from: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    if ttl.is_zero() {
        return Err(Error::validation("ttl", "must be greater than zero"));
    }
    let delta = chrono::Duration::from_std(ttl)
        .map_err(|_| Error::validation("ttl", format!("{ttl:?} is out of range")))?;
    from.checked_add_signed(delta)
        .ok_or_else(|| Error::validation("ttl", format!("{ttl:?} is out of range")))
}

/// Encodes a timestamp as microseconds since the Unix epoch.
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Decodes a microsecond timestamp written by [`to_micros`].
pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::validation("timestamp", format!("{micros} is out of range")))
}

/// Creation and expiry times returned alongside a value.
///
/// Serializes as `{"createdAt": "<RFC3339>", "expiresAt": "<RFC3339>"}`, with
/// `expiresAt` omitted for records without a TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_at: DateTime<FixedOffset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<FixedOffset>>,
}

/// Result of a successful `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub value: Vec<u8>,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// One row of a query page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryItem {
    pub key: String,
    pub data: Vec<u8>,
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// A page of query results plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub items: Vec<QueryItem>,
    /// Matching live records before limit/offset were applied.
    pub total: u64,
}
