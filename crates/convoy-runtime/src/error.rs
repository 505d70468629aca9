//! Runtime error types.

use thiserror::Error;

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Connection(String),

    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed engine response: {0}")]
    Malformed(String),

    #[error("image pull failed for {image}: {message}")]
    Pull { image: String, message: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("registry error: {0}")]
    Registry(#[from] convoy_registry::RegistryError),

    #[error("invalid image: {0}")]
    Image(#[from] convoy_core::ImageError),

    #[error("container {0} stopped unexpectedly")]
    StoppedUnexpectedly(String),

    #[error("unable to load registry credentials from {path}: {reason}")]
    Credentials { path: String, reason: String },

    #[error("image not found after pull: {0}")]
    ImageNotFound(String),

    #[error("app {0} has no version deployed")]
    NoVersion(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Configuration errors the daemon should exit on.
    pub fn is_fatal(&self) -> bool {
        match self {
            RuntimeError::Credentials { .. } => true,
            RuntimeError::Registry(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
