//! Storage backends for uploads and artifacts.
//!
//! Exactly one backend is active per deployment. Keys are backend-relative,
//! e.g. `uploads/<id>_input.docx` or `outputs/<id>_output.pdf`. Converters
//! always work on files in the local scratch area; remote backends receive
//! the artifact once it is complete.

mod local;
mod object;

pub use self::local::LocalStorage;
pub use self::object::ObjectStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendConfig, StorageConfig};
use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
    Supabase,
    Memory,
}

impl BackendKind {
    /// Whether artifacts live somewhere other than the local scratch area.
    pub fn is_remote(self) -> bool {
        !matches!(self, BackendKind::Local)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::Supabase => write!(f, "supabase"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub message: String,
    /// Direct or signed URL, when the backend can produce one.
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Where uploads and artifacts live.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Stores the file at `local` under `key`.
    ///
    /// Remote backends verify the object exists with the expected size
    /// before reporting success.
    ///
    /// # Arguments
    ///
    /// * `local` - Path of the finished file in the scratch area
    /// * `key` - Backend-relative key, e.g. `outputs/<id>_output.pdf`
    ///
    /// # Returns
    ///
    /// Returns a human-readable message and, when the backend can produce
    /// one, a direct or signed URL. Fails with [`StorageError::Unverified`]
    /// when the stored object cannot be confirmed.
    async fn upload(&self, local: &Path, key: &str) -> Result<Uploaded, StorageError>;

    /// Copies the object at `key` to `local`, replacing anything there.
    ///
    /// # Returns
    ///
    /// Returns a human-readable message, or [`StorageError::NotFound`] when
    /// no object exists under `key`.
    async fn download(&self, key: &str, local: &Path) -> Result<String, StorageError>;

    /// Removes the object at `key`.
    async fn delete(&self, key: &str) -> Result<String, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Objects whose key starts with `prefix`; an empty prefix lists everything.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Deletes objects older than `max_age`.
    ///
    /// Individual deletion failures are logged and skipped.
    ///
    /// # Arguments
    ///
    /// * `max_age` - Objects last modified longer ago than this are removed
    ///
    /// # Returns
    ///
    /// Returns how many objects were deleted, or an error if the objects
    /// could not be listed at all.
    async fn cleanup_expired(&self, max_age: Duration) -> Result<usize, StorageError>;
}

/// Rejects keys that could escape the storage root.
pub fn validate_key(key: &str) -> Result<&str, StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

/// Builds the backend selected at boot.
pub fn build_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match &config.backend {
        BackendConfig::Local => Arc::new(LocalStorage::new(&config.root)),
        BackendConfig::S3(settings) => Arc::new(ObjectStorage::s3(BackendKind::S3, settings)?),
        BackendConfig::Supabase(settings) => Arc::new(ObjectStorage::s3(BackendKind::Supabase, settings)?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("outputs/abc_output.pdf").is_ok());
        assert!(validate_key("uploads/abc_input.docx").is_ok());

        for bad in ["", "/etc/passwd", "../secret", "outputs/../../x", "a//b", "a\\b", "outputs/"] {
            assert!(
                matches!(validate_key(bad), Err(StorageError::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_remote_kinds() {
        assert!(!BackendKind::Local.is_remote());
        assert!(BackendKind::S3.is_remote());
        assert!(BackendKind::Supabase.is_remote());
        assert!(BackendKind::Memory.is_remote());
    }
}
