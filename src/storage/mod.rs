//! The durable store, as seen by this crate.
//!
//! Only create/read/write/not-found semantics matter here. Real blob and queue SDKs are adapted
//! to these traits by the host; [memory] and [fs] provide process-local and directory-backed
//! implementations.

pub mod fs;
pub mod memory;
pub mod retry;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

pub use retry::{add_message_and_create_if_not_exists, create_and_retry_once};

/// Failures reported by a durable store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The container does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A failure that may succeed if tried again later, e.g. a timeout or server throttling.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Any other failure.
    #[error("storage failure: {0}")]
    Other(String),
}

impl StorageError {
    /// The container the operation targeted does not exist.
    pub fn is_container_not_found(&self) -> bool {
        matches!(self, StorageError::ContainerNotFound(_))
    }

    /// The queue the operation targeted does not exist.
    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, StorageError::QueueNotFound(_))
    }

    /// The targeted container or queue does not exist.
    pub fn is_not_found(&self) -> bool {
        self.is_container_not_found() || self.is_queue_not_found()
    }
}

/// A named container of blobs.
///
/// Blob paths are `/`-separated. Replacing a blob is atomic: readers see either the old content
/// or the new content, never a mix.
#[async_trait]
pub trait BlobContainer: Debug + Send + Sync {
    /// The container name.
    fn name(&self) -> &str;

    /// Create the container if it doesn't already exist.
    ///
    /// Returns `true` if it was created by this call.
    async fn create_if_not_exists(&self) -> Result<bool, StorageError>;

    /// Create or replace the blob at `path`.
    ///
    /// Fails with [StorageError::ContainerNotFound] if the container doesn't exist.
    async fn upload_text(&self, path: &str, content: &str) -> Result<(), StorageError>;

    /// Fetch the blob at `path`.
    ///
    /// Returns `None` if the blob doesn't exist. Fails with [StorageError::ContainerNotFound] if
    /// the container doesn't exist.
    async fn download_text(&self, path: &str) -> Result<Option<String>, StorageError>;

    /// Whether a blob exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Delete the blob at `path`, returning `true` if it existed.
    async fn delete_blob(&self, path: &str) -> Result<bool, StorageError>;

    /// Paths of all blobs starting with `prefix`, sorted.
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Hands out container references for one storage account.
///
/// Getting a reference never touches the store, so the container may not exist yet.
pub trait BlobServiceClient: Debug + Send + Sync {
    /// A reference to the named container.
    fn container(&self, name: &str) -> Arc<dyn BlobContainer>;
}

/// A named message queue.
#[async_trait]
pub trait MessageQueue: Debug + Send + Sync {
    /// The queue name.
    fn name(&self) -> &str;

    /// Create the queue if it doesn't already exist.
    ///
    /// Returns `true` if it was created by this call.
    async fn create_if_not_exists(&self) -> Result<bool, StorageError>;

    /// Append a message.
    ///
    /// Fails with [StorageError::QueueNotFound] if the queue doesn't exist.
    async fn add_message(&self, message: &str) -> Result<(), StorageError>;
}

/// Rejects paths which could escape the container, such as `../x` or `/x`.
pub(crate) fn validate_blob_path(path: &str) -> Result<(), StorageError> {
    let valid = !path.is_empty()
        && !path.starts_with('/')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");

    if valid {
        Ok(())
    } else {
        Err(StorageError::Other(format!("invalid blob path: {path:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths() {
        assert!(validate_blob_path("concurrency/host/concurrencyStatus.json").is_ok());
        assert!(validate_blob_path("file.json").is_ok());

        assert!(validate_blob_path("").is_err());
        assert!(validate_blob_path("/abs").is_err());
        assert!(validate_blob_path("a//b").is_err());
        assert!(validate_blob_path("a/../b").is_err());
        assert!(validate_blob_path("a/./b").is_err());
    }

    #[test]
    fn not_found_classification() {
        assert!(StorageError::ContainerNotFound("c".into()).is_container_not_found());
        assert!(!StorageError::ContainerNotFound("c".into()).is_queue_not_found());
        assert!(StorageError::QueueNotFound("q".into()).is_queue_not_found());
        assert!(!StorageError::Transient("timeout".into()).is_container_not_found());
        assert!(StorageError::QueueNotFound("q".into()).is_not_found());
        assert!(!StorageError::Other("denied".into()).is_not_found());
    }
}
