//! Configuration types for store backends.
//!
//! This module provides configuration structs for selecting and tuning a
//! backend, loadable from TOML files. It includes:
//!
//! - [`StoreConfig`] - Root configuration with the provider discriminator
//! - [`DurableConfig`] - SQLite-backed durable store settings
//! - [`CacheConfig`] - In-memory cache store settings
//!
//! All configuration types support serde deserialization and provide
//! defaults suitable for local development.
//!
//! ```toml
//! provider = "durable"
//! operation_timeout_ms = 2000
//!
//! [durable]
//! data_dir = "/var/lib/duokv"
//! database_name = "sessions"
//! table_name = "kv_records"
//! timezone = "UTC"
//! sweep_interval_secs = 30
//! ```

use crate::error::{Error, Result};
use chrono::{FixedOffset, Local, Offset, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// `data_dir` value that selects a private in-memory SQLite database.
pub const IN_MEMORY: &str = ":memory:";

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Closed set of backend providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// SQLite-backed store with an active TTL sweeper.
    Durable,
    /// In-memory cache with native per-key expiry.
    Cache,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Cache => "cache",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" => Ok(Self::Durable),
            "cache" => Ok(Self::Cache),
            _ => Err(Error::provider_not_found(s)),
        }
    }
}

/// Root configuration file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Provider name; resolved with [`Provider::from_str`].
    pub provider: String,
    /// Default per-call deadline in milliseconds.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default)]
    pub durable: Option<DurableConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

impl StoreConfig {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Required fields are missing or have invalid types
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Resolves the provider and returns its typed backend configuration.
    ///
    /// A missing provider section falls back to that provider's defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] for an unknown provider name.
    pub fn backend(&self) -> Result<BackendConfig> {
        Ok(match self.provider.parse::<Provider>()? {
            Provider::Durable => BackendConfig::Durable(self.durable.clone().unwrap_or_default()),
            Provider::Cache => BackendConfig::Cache(self.cache.clone().unwrap_or_default()),
        })
    }

    /// Default per-call deadline, if configured.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

/// Typed configuration for one provider.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Durable(DurableConfig),
    Cache(CacheConfig),
}

impl BackendConfig {
    /// Deserializes a provider-specific options table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotFound`] for an unknown provider and
    /// [`Error::Validation`] if the options do not fit the provider.
    pub fn from_table(provider: &str, options: toml::Table) -> Result<Self> {
        let provider: Provider = provider.parse()?;
        let invalid = |e: toml::de::Error| Error::validation(provider.as_str(), e.to_string());
        Ok(match provider {
            Provider::Durable => {
                Self::Durable(toml::Value::Table(options).try_into().map_err(invalid)?)
            },
            Provider::Cache => {
                Self::Cache(toml::Value::Table(options).try_into().map_err(invalid)?)
            },
        })
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::Durable(_) => Provider::Durable,
            Self::Cache(_) => Provider::Cache,
        }
    }

    /// Validates the active provider's settings.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting as a validation error.
    pub fn validate(&self) -> Result<ValidationResult> {
        match self {
            Self::Durable(c) => c.validate(),
            Self::Cache(c) => c.validate(),
        }
    }
}

/// Durable (SQLite) backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DurableConfig {
    /// Directory holding database files, or `:memory:`.
    pub data_dir: PathBuf,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Database file stem inside `data_dir`.
    pub database_name: String,
    pub table_name: String,
    pub ssl_mode: Option<String>,
    /// `UTC`, `Local`, or a fixed offset such as `+05:30`.
    pub timezone: String,
    pub sweep_interval_secs: u64,
    /// How long SQLite waits on a locked database before failing a call.
    pub busy_timeout_ms: u64,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            user: None,
            password: None,
            database_name: "duokv".to_string(),
            table_name: "kv_records".to_string(),
            ssl_mode: None,
            timezone: "UTC".to_string(),
            sweep_interval_secs: 60,
            busy_timeout_ms: 5000,
        }
    }
}

impl DurableConfig {
    /// Settings for a private in-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            data_dir: PathBuf::from(IN_MEMORY),
            ..Self::default()
        }
    }

    /// Settings for a database file under `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.data_dir.as_os_str() == IN_MEMORY
    }

    /// Path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.database_name))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Offset used to render metadata timestamps.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `timezone` is not recognized.
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_timezone(&self.timezone)
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `database_name` is empty or contains path separators
    /// - `table_name` is not a plain SQL identifier
    /// - `timezone` cannot be parsed
    /// - `sweep_interval_secs` is zero
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut warnings = Vec::new();

        if self.database_name.is_empty()
            || self.database_name.contains(['/', '\\'])
            || self.database_name.starts_with('.')
        {
            return Err(Error::validation(
                "database_name",
                format!("'{}' is not a valid database name", self.database_name),
            ));
        }

        validate_identifier("table_name", &self.table_name)?;
        self.offset()?;

        if self.sweep_interval_secs == 0 {
            return Err(Error::validation(
                "sweep_interval_secs",
                "must be greater than zero",
            ));
        }

        if self.user.is_some() || self.password.is_some() {
            warnings.push(
                "durable: credentials are ignored by the embedded SQLite engine".to_string(),
            );
        }
        if self.ssl_mode.is_some() {
            warnings.push("durable: ssl_mode is ignored by the embedded SQLite engine".to_string());
        }

        Ok(ValidationResult { warnings })
    }
}

/// Cache backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Name of the cache engine instance, used in logs.
    pub name: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Logical namespace index; keys in different namespaces never collide.
    pub namespace: u16,
    /// Entry limit past which moka evicts live entries. Unset means no
    /// size-based eviction; records then leave only by delete or expiry.
    pub max_capacity: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            user: None,
            password: None,
            namespace: 0,
            max_capacity: None,
        }
    }
}

impl CacheConfig {
    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_capacity` is set to zero.
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut warnings = Vec::new();

        if self.max_capacity == Some(0) {
            return Err(Error::validation("max_capacity", "must be greater than zero"));
        }
        if let Some(limit) = self.max_capacity {
            warnings.push(format!(
                "cache: entries past max_capacity ({limit}) are evicted even without a TTL"
            ));
        }
        if self.user.is_some() || self.password.is_some() {
            warnings.push("cache: credentials are ignored by the in-process cache".to_string());
        }

        Ok(ValidationResult { warnings })
    }
}

/// Accepts letters, digits and underscores, not starting with a digit.
fn validate_identifier(field: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(
            field,
            format!("'{name}' must contain only letters, digits and underscores"),
        ))
    }
}

/// Parses `UTC`, `Local`, or `±HH:MM`.
fn parse_timezone(tz: &str) -> Result<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Ok(Utc.fix());
    }
    if tz.eq_ignore_ascii_case("local") {
        return Ok(*Local::now().offset());
    }
    tz.parse::<FixedOffset>()
        .map_err(|_| Error::validation("timezone", format!("unrecognized timezone '{tz}'")))
}
