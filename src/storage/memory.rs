//! Process-local storage.
//!
//! Behaves like a remote store with respect to provisioning: containers and queues must be created
//! before use. Upload and download failures can be injected to exercise recovery paths.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{validate_blob_path, BlobContainer, BlobServiceClient, MessageQueue, StorageError};

type Blobs = BTreeMap<String, String>;

/// An in-memory blob service.
///
/// Cheaply cloneable. Clones share the same containers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobService {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<String, Blobs>,
    upload_faults: VecDeque<StorageError>,
    download_faults: VecDeque<StorageError>,
    uploads: usize,
}

/// A container in an [InMemoryBlobService].
#[derive(Debug, Clone)]
pub struct InMemoryBlobContainer {
    name: String,
    state: Arc<Mutex<State>>,
}

impl InMemoryBlobService {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next upload (to any container) with `error`.
    ///
    /// Multiple injected faults are consumed in order, one per upload attempt.
    pub async fn inject_upload_failure(&self, error: StorageError) {
        self.state.lock().await.upload_faults.push_back(error);
    }

    /// Fail the next download (from any container) with `error`.
    pub async fn inject_download_failure(&self, error: StorageError) {
        self.state.lock().await.download_faults.push_back(error);
    }

    /// Number of successful uploads across all containers.
    pub async fn upload_count(&self) -> usize {
        self.state.lock().await.uploads
    }

    /// Delete a container and everything in it.
    pub async fn delete_container(&self, name: &str) -> bool {
        self.state.lock().await.containers.remove(name).is_some()
    }
}

impl BlobServiceClient for InMemoryBlobService {
    fn container(&self, name: &str) -> Arc<dyn BlobContainer> {
        Arc::new(InMemoryBlobContainer {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

impl InMemoryBlobContainer {
    fn not_found(&self) -> StorageError {
        StorageError::ContainerNotFound(self.name.clone())
    }
}

#[async_trait]
impl BlobContainer for InMemoryBlobContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_if_not_exists(&self) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        if state.containers.contains_key(&self.name) {
            return Ok(false);
        }
        state.containers.insert(self.name.clone(), Blobs::new());
        Ok(true)
    }

    async fn upload_text(&self, path: &str, content: &str) -> Result<(), StorageError> {
        validate_blob_path(path)?;

        let mut state = self.state.lock().await;
        if let Some(fault) = state.upload_faults.pop_front() {
            return Err(fault);
        }

        let blobs = state
            .containers
            .get_mut(&self.name)
            .ok_or_else(|| self.not_found())?;
        blobs.insert(path.to_string(), content.to_string());
        state.uploads += 1;

        Ok(())
    }

    async fn download_text(&self, path: &str) -> Result<Option<String>, StorageError> {
        validate_blob_path(path)?;

        let mut state = self.state.lock().await;
        if let Some(fault) = state.download_faults.pop_front() {
            return Err(fault);
        }

        let blobs = state
            .containers
            .get(&self.name)
            .ok_or_else(|| self.not_found())?;

        Ok(blobs.get(path).cloned())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.download_text(path).await?.is_some())
    }

    async fn delete_blob(&self, path: &str) -> Result<bool, StorageError> {
        validate_blob_path(path)?;

        let mut state = self.state.lock().await;
        let blobs = state
            .containers
            .get_mut(&self.name)
            .ok_or_else(|| self.not_found())?;

        Ok(blobs.remove(path).is_some())
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        let blobs = state
            .containers
            .get(&self.name)
            .ok_or_else(|| self.not_found())?;

        Ok(blobs
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// An in-memory message queue.
///
/// Cheaply cloneable. Clones share the same messages.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    name: String,
    /// `None` until the queue is created.
    messages: Arc<Mutex<Option<Vec<String>>>>,
}

impl InMemoryQueue {
    /// A reference to a queue which doesn't exist yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Arc::new(Mutex::new(None)),
        }
    }

    /// All messages added so far, or `None` if the queue doesn't exist.
    pub async fn messages(&self) -> Option<Vec<String>> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_if_not_exists(&self) -> Result<bool, StorageError> {
        let mut messages = self.messages.lock().await;
        if messages.is_some() {
            return Ok(false);
        }
        *messages = Some(Vec::new());
        Ok(true)
    }

    async fn add_message(&self, message: &str) -> Result<(), StorageError> {
        self.messages
            .lock()
            .await
            .as_mut()
            .ok_or_else(|| StorageError::QueueNotFound(self.name.clone()))?
            .push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn container_must_exist() {
        let service = InMemoryBlobService::new();
        let container = service.container("hosts");

        assert_eq!(
            container.upload_text("a.json", "{}").await,
            Err(StorageError::ContainerNotFound("hosts".into()))
        );
        assert_eq!(
            container.download_text("a.json").await,
            Err(StorageError::ContainerNotFound("hosts".into()))
        );

        assert!(container.create_if_not_exists().await.unwrap());
        assert!(!container.create_if_not_exists().await.unwrap());

        container.upload_text("a.json", "{}").await.unwrap();
        assert_eq!(
            container.download_text("a.json").await.unwrap().as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn clones_share_containers() {
        let service = InMemoryBlobService::new();
        let other = service.clone();

        let container = service.container("hosts");
        container.create_if_not_exists().await.unwrap();
        container.upload_text("x/y.json", "1").await.unwrap();

        assert!(other.container("hosts").exists("x/y.json").await.unwrap());
        assert_eq!(other.upload_count().await, 1);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let service = InMemoryBlobService::new();
        let container = service.container("hosts");
        container.create_if_not_exists().await.unwrap();

        service
            .inject_upload_failure(StorageError::Transient("503".into()))
            .await;

        assert_eq!(
            container.upload_text("a", "1").await,
            Err(StorageError::Transient("503".into()))
        );
        assert!(container.upload_text("a", "1").await.is_ok());

        service
            .inject_download_failure(StorageError::Other("403".into()))
            .await;

        assert_eq!(
            container.download_text("a").await,
            Err(StorageError::Other("403".into()))
        );
        assert_eq!(container.download_text("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let service = InMemoryBlobService::new();
        let container = service.container("hosts");
        container.create_if_not_exists().await.unwrap();

        container.upload_text("concurrency/a/s.json", "1").await.unwrap();
        container.upload_text("concurrency/b/s.json", "2").await.unwrap();
        container.upload_text("other/c.json", "3").await.unwrap();

        assert_eq!(
            container.list_blobs("concurrency/").await.unwrap(),
            vec!["concurrency/a/s.json", "concurrency/b/s.json"]
        );

        assert!(container.delete_blob("concurrency/a/s.json").await.unwrap());
        assert!(!container.delete_blob("concurrency/a/s.json").await.unwrap());
        assert!(service.delete_container("hosts").await);
        assert!(container.exists("other/c.json").await.is_err());
    }

    #[tokio::test]
    async fn queue_must_exist() {
        let queue = InMemoryQueue::new("q");

        assert_eq!(
            queue.add_message("m").await,
            Err(StorageError::QueueNotFound("q".into()))
        );
        assert_eq!(queue.messages().await, None);

        queue.create_if_not_exists().await.unwrap();
        queue.add_message("m").await.unwrap();
        assert_eq!(queue.messages().await, Some(vec!["m".to_string()]));
    }
}
