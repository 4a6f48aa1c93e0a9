//! Error types for store operations.
//!
//! Every backend reports failures through [`Error`], so callers can match on
//! the same variants regardless of which provider is configured.

/// Boxed engine error carried by [`Error::Connection`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Unknown backend discriminator at construction time.
    #[error("store provider not found: {name}")]
    ProviderNotFound { name: String },

    /// Key is absent, or present but expired.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// Insert-only write found a live record for the key.
    #[error("key already exists: {key}")]
    KeyAlreadyExists { key: String },

    /// Malformed input (key, ttl, pattern, filter, pagination, config).
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The underlying engine could not be reached or rejected the call.
    #[error("{operation} failed (key: {}): {source}", .key.as_deref().unwrap_or("-"))]
    Connection {
        operation: &'static str,
        key: Option<String>,
        #[source]
        source: BoxError,
    },

    /// Caller-supplied deadline elapsed.
    #[error("{operation} timed out after {timeout_ms}ms (key: {})", .key.as_deref().unwrap_or("-"))]
    Timeout {
        operation: &'static str,
        key: Option<String>,
        timeout_ms: u64,
    },

    /// The store was closed.
    #[error("store is closed")]
    Closed,

    /// The selected provider does not implement the operation.
    #[error("{operation} is not supported by the {provider} provider")]
    Unsupported {
        operation: &'static str,
        provider: &'static str,
    },

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a provider not found error.
    pub fn provider_not_found(name: impl Into<String>) -> Self {
        Self::ProviderNotFound { name: name.into() }
    }

    /// Create a key not found error.
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Create a key already exists error.
    pub fn key_already_exists(key: impl Into<String>) -> Self {
        Self::KeyAlreadyExists { key: key.into() }
    }

    /// Create a validation error for a named field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an engine failure with the operation and key it happened on.
    pub fn connection(
        operation: &'static str,
        key: Option<&str>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connection {
            operation,
            key: key.map(str::to_string),
            source: source.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: &'static str, key: Option<&str>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation,
            key: key.map(str::to_string),
            timeout_ms,
        }
    }

    /// Returns true for [`Error::KeyNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }
}
