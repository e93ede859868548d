//! Object-store backend: S3, Supabase's S3-compatible endpoint, or memory.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{validate_key, BackendKind, ObjectMeta, StorageBackend, Uploaded};
use crate::config::S3Settings;
use crate::error::StorageError;

pub struct ObjectStorage {
    kind: BackendKind,
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    url_expiry: Duration,
    public_base_url: Option<String>,
}

impl ObjectStorage {
    pub fn new(kind: BackendKind, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            kind,
            store,
            signer: None,
            url_expiry: Duration::from_secs(3600),
            public_base_url: None,
        }
    }

    /// Process-local store, used by tests and development setups.
    pub fn in_memory() -> Self {
        Self::new(BackendKind::Memory, Arc::new(InMemory::new()))
    }

    /// Signs download URLs valid for `expiry`.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>, expiry: Duration) -> Self {
        self.signer = Some(signer);
        self.url_expiry = expiry;
        self
    }

    /// Serves objects from `<base>/<key>` instead of signing URLs.
    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    /// Connects to an S3-compatible bucket. Credentials not given in
    /// `settings` come from the standard AWS environment.
    pub fn s3(kind: BackendKind, settings: &S3Settings) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if settings.allow_http {
            builder = builder.with_allow_http(true);
        }
        if let Some(key_id) = &settings.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &settings.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        let s3 = Arc::new(builder.build()?);
        let mut storage = Self::new(kind, s3.clone()).with_signer(s3, settings.url_expiry);
        if let Some(base) = &settings.public_base_url {
            storage = storage.with_public_base_url(base);
        }

        info!(backend = %kind, bucket = %settings.bucket, "Object storage configured");
        Ok(storage)
    }

    fn location(key: &str) -> Result<ObjectPath, StorageError> {
        ObjectPath::parse(validate_key(key)?).map_err(|_| StorageError::InvalidKey(key.to_string()))
    }

    async fn public_url(&self, key: &str, location: &ObjectPath) -> Option<String> {
        if let Some(base) = &self.public_base_url {
            return Some(format!("{base}/{key}"));
        }
        let signer = self.signer.as_ref()?;
        match signer
            .signed_url(http::Method::GET, location, self.url_expiry)
            .await
        {
            Ok(url) => Some(url.to_string()),
            Err(err) => {
                warn!(key, error = %err, "Failed to sign download URL");
                None
            }
        }
    }

    /// Deletes every object last modified before `cutoff`, in one batched
    /// request where the store supports it.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let expired: Vec<ObjectPath> = self
            .store
            .list(None)
            .try_filter_map(|meta| async move {
                Ok::<_, object_store::Error>((meta.last_modified < cutoff).then_some(meta.location))
            })
            .try_collect()
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let locations: BoxStream<'_, object_store::Result<ObjectPath>> =
            stream::iter(expired.into_iter().map(Ok)).boxed();
        let mut results = self.store.delete_stream(locations);

        let mut deleted = 0;
        while let Some(result) = results.next().await {
            match result {
                Ok(location) => {
                    debug!(key = %location, "Deleted expired object");
                    deleted += 1;
                }
                Err(err) => warn!(error = %err, "Failed to delete expired object"),
            }
        }
        Ok(deleted)
    }

    /// Checks that the object at `location` is visible with `expected` bytes.
    async fn verify_upload(&self, location: &ObjectPath, key: &str, expected: usize) -> Result<(), StorageError> {
        let unverified = |reason: String| StorageError::Unverified {
            key: key.to_string(),
            reason,
        };
        match self.store.head(location).await {
            Ok(meta) if meta.size as usize == expected => Ok(()),
            Ok(meta) => {
                warn!(key, expected, actual = meta.size as usize, "Uploaded object size mismatch");
                Err(unverified(format!("expected {expected} bytes, found {}", meta.size)))
            }
            Err(err) => {
                warn!(key, error = %err, "Uploaded object not visible");
                Err(unverified(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStorage {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn upload(&self, local: &Path, key: &str) -> Result<Uploaded, StorageError> {
        let location = Self::location(key)?;
        let data = Bytes::from(fs::read(local).await?);
        let expected = data.len();

        self.store
            .put(&location, PutPayload::from(data))
            .await
            .map_err(|err| StorageError::Upload {
                key: key.to_string(),
                message: err.to_string(),
            })?;

        self.verify_upload(&location, key, expected).await?;

        debug!(key, bytes = expected, backend = %self.kind, "Uploaded object");
        Ok(Uploaded {
            message: format!("File uploaded to {} as {key}", self.kind),
            public_url: self.public_url(key, &location).await,
        })
    }

    async fn download(&self, key: &str, local: &Path) -> Result<String, StorageError> {
        let location = Self::location(key)?;
        let data = self.store.get(&location).await?.bytes().await?;

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = local.with_extension("part");
        fs::write(&partial, &data).await?;
        fs::rename(&partial, local).await?;

        Ok(format!("Downloaded {key} ({} bytes)", data.len()))
    }

    async fn delete(&self, key: &str) -> Result<String, StorageError> {
        let location = Self::location(key)?;
        self.store.delete(&location).await?;
        Ok(format!("Deleted {key} from {}", self.kind))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let location = Self::location(key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let mut objects: Vec<ObjectMeta> = self
            .store
            .list(None)
            .try_filter_map(|meta| async move {
                let key = meta.location.to_string();
                let meta = key.starts_with(prefix).then(|| ObjectMeta {
                    key,
                    size: meta.size as u64,
                    last_modified: meta.last_modified,
                });
                Ok::<_, object_store::Error>(meta)
            })
            .try_collect()
            .await?;

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn cleanup_expired(&self, max_age: Duration) -> Result<usize, StorageError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|err| StorageError::Backend(format!("retention window out of range: {err}")))?;
        let deleted = self.cleanup_older_than(Utc::now() - max_age).await?;
        info!(deleted, backend = %self.kind, "Remote cleanup finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn put(storage: &ObjectStorage, key: &str, contents: &str) {
        let scratch = TempDir::new().unwrap();
        let local = scratch.path().join("file");
        std::fs::write(&local, contents).unwrap();
        storage.upload(&local, key).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_verifies_and_round_trips() {
        let storage = ObjectStorage::in_memory();
        put(&storage, "outputs/a_output.pdf", "%PDF-1.7").await;

        assert!(storage.exists("outputs/a_output.pdf").await.unwrap());
        assert!(!storage.exists("outputs/missing.pdf").await.unwrap());

        let scratch = TempDir::new().unwrap();
        let local = scratch.path().join("outputs/a_output.pdf");
        storage.download("outputs/a_output.pdf", &local).await.unwrap();
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "%PDF-1.7");
    }

    #[tokio::test]
    async fn test_public_base_url_is_attached() {
        let storage = ObjectStorage::in_memory().with_public_base_url("https://cdn.example.com/files/");
        let scratch = TempDir::new().unwrap();
        let local = scratch.path().join("file");
        std::fs::write(&local, "x").unwrap();

        let uploaded = storage.upload(&local, "outputs/a_output.png").await.unwrap();
        assert_eq!(
            uploaded.public_url.as_deref(),
            Some("https://cdn.example.com/files/outputs/a_output.png")
        );
    }

    #[tokio::test]
    async fn test_missing_url_is_not_an_error() {
        let storage = ObjectStorage::in_memory();
        let scratch = TempDir::new().unwrap();
        let local = scratch.path().join("file");
        std::fs::write(&local, "x").unwrap();

        let uploaded = storage.upload(&local, "outputs/a_output.png").await.unwrap();
        assert_eq!(uploaded.public_url, None);
    }

    #[tokio::test]
    async fn test_unverified_upload_reports_why() {
        let storage = ObjectStorage::in_memory();
        put(&storage, "outputs/a_output.pdf", "%PDF-1.7").await;

        let location = ObjectStorage::location("outputs/a_output.pdf").unwrap();
        let err = storage
            .verify_upload(&location, "outputs/a_output.pdf", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unverified { .. }));
        assert_eq!(
            err.to_string(),
            "upload of 'outputs/a_output.pdf' could not be verified: expected 1024 bytes, found 8"
        );

        let location = ObjectStorage::location("outputs/gone.pdf").unwrap();
        let err = storage.verify_upload(&location, "outputs/gone.pdf", 8).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("upload of 'outputs/gone.pdf' could not be verified: "), "{message}");
        assert!(message.len() > "upload of 'outputs/gone.pdf' could not be verified: ".len());
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let storage = ObjectStorage::in_memory();
        let scratch = TempDir::new().unwrap();
        let result = storage.download("outputs/nope.pdf", &scratch.path().join("nope.pdf")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let storage = ObjectStorage::in_memory();
        put(&storage, "uploads/a_input.png", "a").await;
        put(&storage, "outputs/a_output.pdf", "b").await;

        let listed = storage.list("outputs/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "outputs/a_output.pdf");
        assert_eq!(listed[0].size, 1);
    }

    #[tokio::test]
    async fn test_cleanup_respects_cutoff_and_is_idempotent() {
        let storage = ObjectStorage::in_memory();
        put(&storage, "outputs/old_output.pdf", "old").await;
        put(&storage, "uploads/old_input.docx", "old").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        put(&storage, "outputs/new_output.pdf", "new").await;

        assert_eq!(storage.cleanup_older_than(cutoff).await.unwrap(), 2);
        assert_eq!(storage.cleanup_older_than(cutoff).await.unwrap(), 0);

        let keys: Vec<_> = storage.list("").await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, ["outputs/new_output.pdf"]);
    }

    #[tokio::test]
    async fn test_cleanup_expired_keeps_recent_objects() {
        let storage = ObjectStorage::in_memory();
        put(&storage, "outputs/a_output.pdf", "a").await;
        assert_eq!(storage.cleanup_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(storage.exists("outputs/a_output.pdf").await.unwrap());
    }
}
