//! Engine error types

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine construction and the event loop.
///
/// Per-operation failures are never reported through this type: they travel
/// through the operation callback as a negative errno in `retval`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Device open/probe failure
    #[error("device error on {path}: {msg}")]
    Device { path: String, msg: String },

    /// Failed to take the advisory exclusive lock
    #[error("failed to lock {path}: {msg}")]
    DeviceLock { path: String, msg: String },

    /// On-disk layout problem detected at open
    #[error("layout error: {0}")]
    Layout(String),

    /// Recovery found state it cannot continue from
    #[error("recovery error: {0}")]
    Recovery(String),

    /// A device write failed; in-memory state can no longer be trusted
    #[error("device write failed (errno {errno}): engine is stopped")]
    DeviceFailed { errno: i32 },

    /// I/O error outside the op path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn layout(msg: impl Into<String>) -> Self {
        Self::Layout(msg.into())
    }
}
