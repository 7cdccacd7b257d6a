//! Directory-backed blob storage.
//!
//! Each container is a directory under a root directory, and each blob is a file. Blobs are
//! replaced by writing a temporary file alongside and renaming it into place, so readers never
//! observe a partially written blob. An upload interrupted before the rename leaves its temporary
//! file behind; these are hidden from listings and swept by
//! [create_if_not_exists](BlobContainer::create_if_not_exists) once they're old enough.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::fs;

use super::{validate_blob_path, BlobContainer, BlobServiceClient, StorageError};

const TEMP_SUFFIX: &str = ".tmp";

/// Temporary files younger than this may belong to an upload still in progress.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Blob storage rooted at a local (or mounted, shared) directory.
#[derive(Debug, Clone)]
pub struct FileSystemBlobService {
    root: PathBuf,
}

/// A container in a [FileSystemBlobService].
#[derive(Debug, Clone)]
pub struct FileSystemBlobContainer {
    name: String,
    dir: PathBuf,
}

impl FileSystemBlobService {
    /// Containers will be created as directories inside `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobServiceClient for FileSystemBlobService {
    fn container(&self, name: &str) -> Arc<dyn BlobContainer> {
        Arc::new(FileSystemBlobContainer {
            name: name.to_string(),
            dir: self.root.join(name),
        })
    }
}

impl FileSystemBlobContainer {
    fn blob_file(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_blob_path(path)?;
        Ok(path.split('/').fold(self.dir.clone(), |p, seg| p.join(seg)))
    }

    async fn ensure_exists(&self) -> Result<(), StorageError> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Other(format!(
                "{} is not a directory",
                self.dir.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::ContainerNotFound(self.name.clone()))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    /// Every file in the container, with its blob path.
    async fn files(&self) -> Result<Vec<(PathBuf, String)>, StorageError> {
        let mut found = Vec::new();
        let mut pending = vec![(self.dir.clone(), String::new())];

        while let Some((dir, relative)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(io_error)?;
            while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };

                if entry.file_type().await.map_err(io_error)?.is_dir() {
                    pending.push((entry.path(), path));
                } else {
                    found.push((entry.path(), path));
                }
            }
        }

        Ok(found)
    }

    /// Remove temporary files left by interrupted uploads. Returns how many were removed.
    async fn remove_stale_temp_files(&self) -> Result<usize, StorageError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for (file, path) in self.files().await? {
            if !path.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let modified = fs::metadata(&file)
                .await
                .and_then(|meta| meta.modified())
                .map_err(io_error)?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < STALE_TEMP_AGE {
                continue;
            }

            match fs::remove_file(&file).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(e)),
            }
        }

        if removed > 0 {
            tracing::debug!(container = %self.name, removed, "Removed stale temporary files");
        }
        Ok(removed)
    }
}

#[async_trait]
impl BlobContainer for FileSystemBlobContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_if_not_exists(&self) -> Result<bool, StorageError> {
        match self.ensure_exists().await {
            Ok(()) => {
                self.remove_stale_temp_files().await?;
                Ok(false)
            }
            Err(StorageError::ContainerNotFound(_)) => {
                fs::create_dir_all(&self.dir).await.map_err(io_error)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_text(&self, path: &str, content: &str) -> Result<(), StorageError> {
        let file = self.blob_file(path)?;
        self.ensure_exists().await?;

        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let temp = temp_path(&file);
        if let Err(e) = fs::write(&temp, content).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(e));
        }
        if let Err(e) = fs::rename(&temp, &file).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(e));
        }

        Ok(())
    }

    async fn download_text(&self, path: &str) -> Result<Option<String>, StorageError> {
        let file = self.blob_file(path)?;
        self.ensure_exists().await?;

        match fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let file = self.blob_file(path)?;
        self.ensure_exists().await?;

        fs::try_exists(&file).await.map_err(io_error)
    }

    async fn delete_blob(&self, path: &str) -> Result<bool, StorageError> {
        let file = self.blob_file(path)?;
        self.ensure_exists().await?;

        match fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_exists().await?;

        let mut found: Vec<String> = self
            .files()
            .await?
            .into_iter()
            .map(|(_, path)| path)
            .filter(|path| !path.ends_with(TEMP_SUFFIX) && path.starts_with(prefix))
            .collect();

        found.sort();
        Ok(found)
    }
}

fn temp_path(file: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = file.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{n}{TEMP_SUFFIX}", std::process::id()));
    file.with_file_name(name)
}

fn io_error(e: io::Error) -> StorageError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
            StorageError::Transient(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}
