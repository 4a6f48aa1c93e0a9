//! Query descriptors for pattern-matched, filtered, paginated reads.
//!
//! A [`Query`] combines a glob-style key pattern, an optional equality
//! [`QueryFilter`], an optional [`TimeRange`] over write timestamps and a
//! [`Pagination`] window. Loosely-typed JSON payloads are parsed into these
//! types up front and rejected when they name unknown fields or carry values of
//! the wrong type, so nothing reaches the engine unvalidated.
//!
//! # Example
//!
//! ```
//! use duokv::query::{Pagination, Query, QueryFilter};
//!
//! let query = Query::new("user/*")
//!     .with_filter(QueryFilter::from_json(r#"{"is_ttl_based": false}"#).unwrap())
//!     .with_page(Pagination::new().limit(20).offset(40));
//! assert_eq!(query.pattern(), "user/*");
//! ```

use crate::error::{Error, Result};
use crate::record::to_micros;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

/// Escape character used in generated `LIKE` patterns.
pub const LIKE_ESCAPE: char = '\\';

/// Translates a glob-style key pattern into a SQL `LIKE` pattern.
///
/// `*` becomes `%`; literal `%`, `_` and `\` are escaped so they only match
/// themselves. The result must be used with `ESCAPE '\'`.
pub fn pattern_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len() + 4);
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '%' | '_' | LIKE_ESCAPE => {
                like.push(LIKE_ESCAPE);
                like.push(c);
            },
            _ => like.push(c),
        }
    }
    like
}

/// Record fields that may appear in a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterField {
    Key,
    Value,
    IsTtlBased,
}

impl FilterField {
    /// Column name in the durable schema.
    pub fn column(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Value => "value",
            Self::IsTtlBased => "is_ttl_based",
        }
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for FilterField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "key" => Ok(Self::Key),
            "value" => Ok(Self::Value),
            "is_ttl_based" => Ok(Self::IsTtlBased),
            other => Err(Error::validation(
                other,
                "unknown filter field (expected key, value or is_ttl_based)",
            )),
        }
    }
}

/// Required value of a filter predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Bool(bool),
}

/// Equality constraint `field = value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub field: FilterField,
    pub value: FilterValue,
}

impl Predicate {
    /// Builds a predicate, checking that the value type suits the field.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the field on a type mismatch.
    pub fn new(field: FilterField, value: FilterValue) -> Result<Self> {
        let type_ok = matches!(
            (field, &value),
            (FilterField::Key | FilterField::Value, FilterValue::Text(_))
                | (FilterField::IsTtlBased, FilterValue::Bool(_))
        );
        if type_ok {
            return Ok(Self { field, value });
        }
        let expected = if field == FilterField::IsTtlBased {
            "expected a boolean"
        } else {
            "expected a string"
        };
        Err(Error::validation(field.to_string(), expected))
    }

    fn sql_param(&self) -> SqlValue {
        match &self.value {
            FilterValue::Text(s) if self.field == FilterField::Value => {
                SqlValue::Blob(s.as_bytes().to_vec())
            },
            FilterValue::Text(s) => SqlValue::Text(s.clone()),
            FilterValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        }
    }
}

/// AND-combined equality predicates over record fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    predicates: Vec<Predicate>,
}

impl QueryFilter {
    /// Creates an empty filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the key to equal `key` exactly.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.push(FilterField::Key, FilterValue::Text(key.into()));
        self
    }

    /// Requires the value bytes to equal the UTF-8 bytes of `value`.
    #[must_use]
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.push(FilterField::Value, FilterValue::Text(value.into()));
        self
    }

    /// Requires the TTL flag to equal `is_ttl_based`.
    #[must_use]
    pub fn ttl_based(mut self, is_ttl_based: bool) -> Self {
        self.push(FilterField::IsTtlBased, FilterValue::Bool(is_ttl_based));
        self
    }

    fn push(&mut self, field: FilterField, value: FilterValue) {
        self.predicates.retain(|p| p.field != field);
        self.predicates.push(Predicate { field, value });
    }

    /// Parses a JSON object mapping field names to required values.
    ///
    /// Blank input yields an empty filter.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the input is not a JSON object, names an
    /// unknown field, or carries a value of the wrong type.
    pub fn from_json(input: &str) -> Result<Self> {
        let Some(map) = parse_object("filter", input)? else {
            return Ok(Self::new());
        };

        let mut filter = Self::new();
        for (name, raw) in map {
            let field: FilterField = name.parse()?;
            let value = match raw {
                JsonValue::String(s) => FilterValue::Text(s),
                JsonValue::Bool(b) => FilterValue::Bool(b),
                other => {
                    return Err(Error::validation(
                        name,
                        format!("unsupported value {other}"),
                    ));
                },
            };
            let predicate = Predicate::new(field, value)?;
            filter.push(predicate.field, predicate.value);
        }
        Ok(filter)
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Limit/offset window over the ordered result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Pagination {
    /// Unbounded window starting at the first result.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Parses `{"limit": N, "offset": M}`; either key may be omitted.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown keys or values that are not
    /// non-negative integers.
    pub fn from_json(input: &str) -> Result<Self> {
        let Some(map) = parse_object("pagination", input)? else {
            return Ok(Self::new());
        };

        let mut page = Self::new();
        for (name, raw) in map {
            let n = raw.as_u64().ok_or_else(|| {
                Error::validation(name.as_str(), "must be a non-negative integer")
            })?;
            match name.as_str() {
                "limit" => page.limit = Some(n),
                "offset" => page.offset = Some(n),
                _ => {
                    return Err(Error::validation(
                        name.as_str(),
                        "unknown pagination field (expected limit or offset)",
                    ));
                },
            }
        }
        Ok(page)
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset_value(&self) -> u64 {
        self.offset.unwrap_or(0)
    }

    /// SQLite `LIMIT`/`OFFSET` operands; `-1` means unbounded.
    fn sql_bounds(&self) -> Result<(i64, i64)> {
        let limit = match self.limit {
            Some(n) => i64::try_from(n).map_err(|_| Error::validation("limit", "too large"))?,
            None => -1,
        };
        let offset = i64::try_from(self.offset_value())
            .map_err(|_| Error::validation("offset", "too large"))?;
        Ok((limit, offset))
    }
}

/// Inclusive bounds on the write timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Builds a range from optional bounds.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `from` is after `to`.
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(f), Some(t)) = (from, to)
            && f > t
        {
            return Err(Error::validation("from", "must not be after 'to'"));
        }
        Ok(Self { from, to })
    }

    /// Parses RFC3339 bounds; `None` or blank leaves that side open.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed timestamps or inverted bounds.
    pub fn parse(from: Option<&str>, to: Option<&str>) -> Result<Self> {
        Self::new(parse_bound("from", from)?, parse_bound("to", to)?)
    }

    pub fn from(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    pub fn to(&self) -> Option<DateTime<Utc>> {
        self.to
    }
}

fn parse_bound(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| Error::validation(field, format!("invalid RFC3339 timestamp: {e}"))),
    }
}

fn parse_object(field: &str, input: &str) -> Result<Option<Map<String, JsonValue>>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<JsonValue>(input) {
        Ok(JsonValue::Object(map)) => Ok(Some(map)),
        Ok(other) => Err(Error::validation(
            field,
            format!("expected a JSON object, got {other}"),
        )),
        Err(e) => Err(Error::validation(field, format!("invalid JSON: {e}"))),
    }
}

/// Pattern, filter, time range and pagination for one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pattern: String,
    filter: QueryFilter,
    range: TimeRange,
    page: Pagination,
}

impl Query {
    /// Matches keys against `pattern`, where `*` matches any sequence.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            filter: QueryFilter::new(),
            range: TimeRange::default(),
            page: Pagination::new(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: Pagination) -> Self {
        self.page = page;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub fn range(&self) -> &TimeRange {
        &self.range
    }

    pub fn page(&self) -> &Pagination {
        &self.page
    }

    /// Builds the WHERE clause and bound parameters for this query.
    ///
    /// Records expired at `now` are excluded, so the count and the page both
    /// see only live records.
    pub(crate) fn to_sql(&self, now: DateTime<Utc>) -> Result<SqlQuery> {
        if self.pattern.is_empty() {
            return Err(Error::validation("pattern", "must not be empty"));
        }
        let (limit, offset) = self.page.sql_bounds()?;

        let mut clauses = vec![
            "key LIKE ? ESCAPE '\\'".to_string(),
            "(is_ttl_based = 0 OR expires_at > ?)".to_string(),
        ];
        let mut params = vec![
            SqlValue::Text(pattern_to_like(&self.pattern)),
            SqlValue::Integer(to_micros(now)),
        ];

        for predicate in self.filter.predicates() {
            clauses.push(format!("{} = ?", predicate.field.column()));
            params.push(predicate.sql_param());
        }
        if let Some(from) = self.range.from {
            clauses.push("ts >= ?".to_string());
            params.push(SqlValue::Integer(to_micros(from)));
        }
        if let Some(to) = self.range.to {
            clauses.push("ts <= ?".to_string());
            params.push(SqlValue::Integer(to_micros(to)));
        }

        Ok(SqlQuery {
            where_clause: clauses.join(" AND "),
            params,
            limit,
            offset,
        })
    }
}

/// SQL fragments produced by [`Query::to_sql`].
#[derive(Debug, Clone)]
pub(crate) struct SqlQuery {
    pub(crate) where_clause: String,
    pub(crate) params: Vec<SqlValue>,
    pub(crate) limit: i64,
    pub(crate) offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rusqlite::Connection;

    fn like_matches(conn: &Connection, text: &str, pattern: &str) -> bool {
        conn.query_row(
            "SELECT ?1 LIKE ?2 ESCAPE '\\'",
            rusqlite::params![text, pattern_to_like(pattern)],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn sqlite() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA case_sensitive_like = ON;").unwrap();
        conn
    }

    #[test]
    fn test_pattern_to_like_translation() {
        assert_eq!(pattern_to_like("user/*"), "user/%");
        assert_eq!(pattern_to_like("*"), "%");
        assert_eq!(pattern_to_like("a_b%c"), "a\\_b\\%c");
        assert_eq!(pattern_to_like("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_user_pattern_matches_nested_keys() {
        let conn = sqlite();
        assert!(like_matches(&conn, "user/1", "user/*"));
        assert!(like_matches(&conn, "user/42/profile", "user/*"));
        assert!(!like_matches(&conn, "admin/1", "user/*"));
    }

    #[test]
    fn test_pattern_is_case_sensitive() {
        let conn = sqlite();
        assert!(!like_matches(&conn, "USER/1", "user/*"));
    }

    #[test]
    fn test_underscore_is_literal() {
        let conn = sqlite();
        assert!(like_matches(&conn, "a_b", "a_b"));
        assert!(!like_matches(&conn, "axb", "a_b"));
    }

    proptest! {
        /// A pattern without wildcards matches exactly its own text.
        #[test]
        fn literal_pattern_matches_itself(text in "[a-z0-9/_%\\\\.:-]{1,24}") {
            let conn = sqlite();
            prop_assert!(like_matches(&conn, &text, &text));
            let longer = format!("{text}x");
            prop_assert!(!like_matches(&conn, &longer, &text));
        }

        /// `prefix*` matches every key that starts with the prefix.
        #[test]
        fn prefix_pattern_matches_extensions(
            prefix in "[a-z0-9/_%]{1,12}",
            suffix in "[a-z0-9/]{0,12}",
        ) {
            let conn = sqlite();
            let key = format!("{prefix}{suffix}");
            let pattern = format!("{prefix}*");
            prop_assert!(like_matches(&conn, &key, &pattern));
        }
    }

    #[test]
    fn test_filter_from_json() {
        let filter =
            QueryFilter::from_json(r#"{"key": "user/1", "is_ttl_based": true}"#).unwrap();
        assert_eq!(filter.predicates().len(), 2);
        assert!(filter.predicates().contains(&Predicate {
            field: FilterField::IsTtlBased,
            value: FilterValue::Bool(true),
        }));
    }

    #[test]
    fn test_filter_blank_is_empty() {
        assert!(QueryFilter::from_json("").unwrap().is_empty());
        assert!(QueryFilter::from_json("   ").unwrap().is_empty());
    }

    #[test]
    fn test_filter_rejects_unknown_field() {
        let err = QueryFilter::from_json(r#"{"owner": "bob"}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "owner"));
    }

    #[test]
    fn test_filter_rejects_wrong_type() {
        let err = QueryFilter::from_json(r#"{"is_ttl_based": "yes"}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "is_ttl_based"));

        let err = QueryFilter::from_json(r#"{"key": 7}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "key"));
    }

    #[test]
    fn test_filter_rejects_non_object() {
        let err = QueryFilter::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "filter"));

        let err = QueryFilter::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "filter"));
    }

    #[test]
    fn test_filter_builder_replaces_same_field() {
        let filter = QueryFilter::new().key("a").key("b");
        assert_eq!(
            filter.predicates(),
            &[Predicate {
                field: FilterField::Key,
                value: FilterValue::Text("b".into()),
            }]
        );
    }

    #[test]
    fn test_pagination_from_json() {
        let page = Pagination::from_json(r#"{"limit": 10, "offset": 5}"#).unwrap();
        assert_eq!(page.limit_value(), Some(10));
        assert_eq!(page.offset_value(), 5);

        let page = Pagination::from_json(r#"{"offset": 3}"#).unwrap();
        assert_eq!(page.limit_value(), None);
        assert_eq!(page.offset_value(), 3);
    }

    #[test]
    fn test_pagination_rejects_negative_and_unknown() {
        let err = Pagination::from_json(r#"{"limit": -1}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "limit"));

        let err = Pagination::from_json(r#"{"page": 2}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "page"));

        let err = Pagination::from_json(r#"{"offset": 1.5}"#).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "offset"));
    }

    #[test]
    fn test_pagination_sql_bounds() {
        assert_eq!(Pagination::new().sql_bounds().unwrap(), (-1, 0));
        assert_eq!(
            Pagination::new().limit(3).offset(9).sql_bounds().unwrap(),
            (3, 9)
        );
        assert!(Pagination::new().limit(u64::MAX).sql_bounds().is_err());
    }

    #[test]
    fn test_time_range_parse() {
        let range = TimeRange::parse(Some("2024-01-01T00:00:00Z"), None).unwrap();
        assert!(range.from().is_some());
        assert!(range.to().is_none());

        let err = TimeRange::parse(Some("yesterday"), None).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "from"));

        let err = TimeRange::parse(Some("2024-02-01T00:00:00Z"), Some("2024-01-01T00:00:00Z"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_to_sql_rejects_empty_pattern() {
        let err = Query::new("").to_sql(Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "pattern"));
    }

    #[test]
    fn test_to_sql_binds_every_predicate() {
        let query = Query::new("user/*")
            .with_filter(QueryFilter::new().value("v").ttl_based(false))
            .with_range(TimeRange::parse(Some("2024-01-01T00:00:00Z"), None).unwrap())
            .with_page(Pagination::new().limit(5));
        let sql = query.to_sql(Utc::now()).unwrap();

        assert_eq!(sql.where_clause.matches('?').count(), sql.params.len());
        assert!(sql.where_clause.contains("value = ?"));
        assert!(sql.where_clause.contains("ts >= ?"));
        assert_eq!(sql.params[2], SqlValue::Blob(b"v".to_vec()));
        assert_eq!((sql.limit, sql.offset), (5, 0));
    }
}
