//! Durable, per-host concurrency snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::cancellable,
    config::Settings,
    error::{Error, Result},
    host_id::HostIdProvider,
    snapshot::HostConcurrencySnapshot,
    storage::{create_and_retry_once, BlobContainer, BlobServiceClient, StorageError},
};

/// The container holding host state.
pub const HOSTS_CONTAINER_NAME: &str = "azure-webjobs-hosts";

/// Stores the latest [HostConcurrencySnapshot] for the current host.
#[async_trait]
pub trait ConcurrencyStatusRepository: Send + Sync {
    /// The last snapshot written for this host.
    ///
    /// Returns `None` if there isn't one, or if it can't be used.
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<HostConcurrencySnapshot>>;

    /// Replace the snapshot for this host.
    async fn write(
        &self,
        snapshot: &HostConcurrencySnapshot,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Snapshots stored as JSON blobs at `concurrency/<hostId>/concurrencyStatus.json` in the
/// [hosts container](HOSTS_CONTAINER_NAME).
///
/// Without a storage connection this runs in a degraded mode: writes are dropped and reads find
/// nothing.
pub struct BlobStorageConcurrencyStatusRepository {
    blob_service: Option<Arc<dyn BlobServiceClient>>,
    host_id_provider: Arc<dyn HostIdProvider>,
}

impl BlobStorageConcurrencyStatusRepository {
    /// `blob_service` is `None` when no storage is configured.
    pub fn new(
        blob_service: Option<Arc<dyn BlobServiceClient>>,
        host_id_provider: Arc<dyn HostIdProvider>,
    ) -> Self {
        Self {
            blob_service,
            host_id_provider,
        }
    }

    /// Connect using the default storage connection, if there is one.
    ///
    /// `connect` turns a connection string into a client. It isn't called when storage isn't
    /// configured.
    pub fn from_settings<C>(
        settings: &Settings,
        host_id_provider: Arc<dyn HostIdProvider>,
        connect: C,
    ) -> Result<Self>
    where
        C: FnOnce(&str) -> Result<Arc<dyn BlobServiceClient>>,
    {
        let blob_service = match settings.storage_connection() {
            Some(connection) => Some(connect(connection)?),
            None => {
                tracing::debug!(
                    "No storage connection configured, concurrency status won't be persisted"
                );
                None
            }
        };
        Ok(Self::new(blob_service, host_id_provider))
    }

    /// Connect using a named storage connection, which must exist.
    pub fn from_named_connection<C>(
        settings: &Settings,
        connection_name: &str,
        host_id_provider: Arc<dyn HostIdProvider>,
        connect: C,
    ) -> Result<Self>
    where
        C: FnOnce(&str) -> Result<Arc<dyn BlobServiceClient>>,
    {
        let connection = settings.require_storage_connection(connection_name)?;
        Ok(Self::new(Some(connect(connection)?), host_id_provider))
    }

    /// The blob path for the current host. Resolves the host ID on every call.
    pub async fn get_blob_path(&self, cancel: &CancellationToken) -> Result<String> {
        let host_id = cancellable(cancel, self.host_id_provider.get_host_id(cancel)).await?;
        Ok(format!("concurrency/{host_id}/concurrencyStatus.json"))
    }

    /// A reference to the hosts container, or `None` if storage isn't configured.
    ///
    /// The container may not exist yet.
    pub async fn get_container(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn BlobContainer>>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self
            .blob_service
            .as_ref()
            .map(|service| service.container(HOSTS_CONTAINER_NAME)))
    }
}

#[async_trait]
impl ConcurrencyStatusRepository for BlobStorageConcurrencyStatusRepository {
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<HostConcurrencySnapshot>> {
        let Some(container) = self.get_container(cancel).await? else {
            return Ok(None);
        };
        let path = self.get_blob_path(cancel).await?;

        let downloaded = cancellable(cancel, async {
            container.download_text(&path).await.map_err(Error::from)
        })
        .await;

        let content = match downloaded {
            Ok(Some(content)) => content,
            Ok(None) => return Ok(None),
            Err(Error::Storage(e)) if e.is_container_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        match HostConcurrencySnapshot::from_json(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Ignoring unreadable concurrency status");
                Ok(None)
            }
        }
    }

    async fn write(
        &self,
        snapshot: &HostConcurrencySnapshot,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(container) = self.get_container(cancel).await? else {
            return Ok(());
        };
        let path = self.get_blob_path(cancel).await?;
        let content = snapshot.to_json()?;

        let container: &dyn BlobContainer = container.as_ref();
        cancellable(cancel, async {
            create_and_retry_once(
                || container.upload_text(&path, &content),
                StorageError::is_container_not_found,
                || async {
                    let created = container.create_if_not_exists().await?;
                    tracing::debug!(
                        container = container.name(),
                        created,
                        "Provisioned missing container"
                    );
                    Ok(())
                },
            )
            .await
            .map_err(Error::from)
        })
        .await
    }
}

/// A repository which stores nothing, for hosts which don't persist concurrency status.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConcurrencyStatusRepository;

#[async_trait]
impl ConcurrencyStatusRepository for NullConcurrencyStatusRepository {
    async fn read(&self, _cancel: &CancellationToken) -> Result<Option<HostConcurrencySnapshot>> {
        Ok(None)
    }

    async fn write(
        &self,
        _snapshot: &HostConcurrencySnapshot,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}
