//! Error types for the Convoy service registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported registry backend: {0}")]
    UnsupportedBackend(String),

    #[error("backend connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("{var} not set on container {container}")]
    MissingAppName { var: &'static str, container: String },

    #[error("container {container} runs app {found}, expected {expected}")]
    AppMismatch {
        container: String,
        found: String,
        expected: String,
    },

    #[error("change watch already running")]
    AlreadyWatching,
}

impl RegistryError {
    /// Configuration errors the process should not try to recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistryError::InvalidUrl { .. } | RegistryError::UnsupportedBackend(_)
        )
    }

    /// Not-found conditions callers are expected to branch on.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::AppNotFound(_) | RegistryError::PoolNotFound(_)
        )
    }
}
