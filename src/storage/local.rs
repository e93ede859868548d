//! Local filesystem backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{validate_key, BackendKind, ObjectMeta, StorageBackend, Uploaded};
use crate::artifact::{OUTPUTS_DIR, UPLOADS_DIR};
use crate::error::StorageError;

/// Stores objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_key(key)?))
    }

    /// Removes every top-level entry of the upload and output directories
    /// last modified before `cutoff`.
    pub async fn cleanup_older_than(&self, cutoff: SystemTime) -> usize {
        let mut deleted = 0;

        for dir in [UPLOADS_DIR, OUTPUTS_DIR] {
            let dir = self.root.join(dir);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "Failed to scan directory for cleanup");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "Failed to read directory entry");
                        break;
                    }
                };
                let path = entry.path();

                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Failed to stat file during cleanup");
                        continue;
                    }
                };
                let expired = metadata.modified().map(|m| m < cutoff).unwrap_or(false);
                if !expired {
                    continue;
                }

                let removed = if metadata.is_dir() {
                    fs::remove_dir_all(&path).await
                } else {
                    fs::remove_file(&path).await
                };
                match removed {
                    Ok(()) => {
                        debug!(path = %path.display(), "Deleted expired file");
                        deleted += 1;
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "Failed to delete expired file"),
                }
            }
        }

        deleted
    }
}

async fn copy_into_place(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::copy(from, to).await?;
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<Uploaded, StorageError> {
        let target = self.path_for(key)?;
        if local != target {
            copy_into_place(local, &target)
                .await
                .map_err(|err| StorageError::Upload {
                    key: key.to_string(),
                    message: err.to_string(),
                })?;
        } else if !fs::try_exists(&target).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(Uploaded {
            message: format!("File saved locally at {}", target.display()),
            public_url: None,
        })
    }

    async fn download(&self, key: &str, local: &Path) -> Result<String, StorageError> {
        let source = self.path_for(key)?;
        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if local != source {
            copy_into_place(&source, local).await?;
        }
        Ok(format!("File available locally at {}", local.display()))
    }

    async fn delete(&self, key: &str) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(format!("Deleted {key}")),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    objects.push(ObjectMeta {
                        key,
                        size: metadata.len(),
                        last_modified: DateTime::<Utc>::from(metadata.modified()?),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn cleanup_expired(&self, max_age: Duration) -> Result<usize, StorageError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let deleted = self.cleanup_older_than(cutoff).await;
        info!(deleted, root = %self.root.display(), "Local cleanup finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use tempfile::TempDir;

    fn write(root: &Path, key: &str, contents: &str) -> PathBuf {
        let path = root.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn age(path: &Path, by: Duration) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_in_place_is_a_no_op() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorage::new(root.path());
        let path = write(root.path(), "outputs/a_output.pdf", "%PDF");

        let uploaded = storage.upload(&path, "outputs/a_output.pdf").await.unwrap();
        assert_eq!(uploaded.public_url, None);
        assert!(storage.exists("outputs/a_output.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let storage = LocalStorage::new(root.path());
        let source = write(scratch.path(), "report.pdf", "%PDF-1.7");

        storage.upload(&source, "outputs/b_output.pdf").await.unwrap();
        let copy = scratch.path().join("copy.pdf");
        storage.download("outputs/b_output.pdf", &copy).await.unwrap();
        assert_eq!(std::fs::read_to_string(&copy).unwrap(), "%PDF-1.7");

        storage.delete("outputs/b_output.pdf").await.unwrap();
        assert!(!storage.exists("outputs/b_output.pdf").await.unwrap());
        assert!(matches!(
            storage.delete("outputs/b_output.pdf").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.download("outputs/b_output.pdf", &copy).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorage::new(root.path());
        assert!(matches!(
            storage.exists("../outside").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorage::new(root.path());
        write(root.path(), "uploads/a_input.png", "a");
        write(root.path(), "outputs/a_output.pdf", "pdf");
        write(root.path(), "outputs/b_output.zip", "zip");

        let keys: Vec<_> = storage
            .list("outputs/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, ["outputs/a_output.pdf", "outputs/b_output.zip"]);
        assert_eq!(storage.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_expired_entries() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorage::new(root.path());
        let old_upload = write(root.path(), "uploads/old_input.docx", "old");
        let old_output = write(root.path(), "outputs/old_output.pdf", "old");
        let fresh = write(root.path(), "outputs/new_output.pdf", "new");
        age(&old_upload, Duration::from_secs(3 * 3600));
        age(&old_output, Duration::from_secs(3 * 3600));

        let retention = Duration::from_secs(3600);
        assert_eq!(storage.cleanup_expired(retention).await.unwrap(), 2);
        assert!(!old_upload.exists());
        assert!(!old_output.exists());
        assert!(fresh.exists());

        assert_eq!(storage.cleanup_expired(retention).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_without_directories() {
        let root = TempDir::new().unwrap();
        let storage = LocalStorage::new(root.path());
        assert_eq!(storage.cleanup_expired(Duration::from_secs(1)).await.unwrap(), 0);
    }
}
