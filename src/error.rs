//! Error types.
//!
//! Normal absence (no storage configured, no snapshot written yet) is modelled with `Option`, not
//! with an error. Everything here is a genuine failure.

use crate::{config::ConfigError, storage::StorageError};

/// Errors returned by repository and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The durable store failed after any recovery (e.g. create-and-retry) was exhausted.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The host identity could not be resolved or was invalid.
    #[error("host id error: {0}")]
    HostId(String),

    /// A snapshot could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration is invalid. Any credential in the offending value has been redacted.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Crate result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
