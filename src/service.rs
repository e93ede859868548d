//! Submit, status and retrieve: the operations behind the HTTP shim.

use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{input_key, ArtifactResolver, ARCHIVE_EXTENSION};
use crate::dispatcher::Dispatcher;
use crate::error::{NotSupported, StorageError};
use crate::format::{extension_of, media_type_for_path, ConversionPair, Format, UnknownFormat};
use crate::job::{Job, JobStatus, PublicStatus};
use crate::queue::{Broker, JobStore, QueueName};
use crate::registry::Registry;
use crate::storage::StorageBackend;

/// Message for ids the job store has never seen or no longer holds.
pub const UNOBSERVED_MESSAGE: &str = "Task is queued but has not been observed yet";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    UnknownFormat(#[from] UnknownFormat),

    #[error(transparent)]
    NotSupported(#[from] NotSupported),

    #[error("file '{filename}' does not match the declared source format '{declared}'")]
    ExtensionMismatch { filename: String, declared: Format },

    #[error("uploaded file is empty")]
    Empty,

    #[error("uploaded file is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to dispatch job: {0:#}")]
    Dispatch(anyhow::Error),
}

impl SubmitError {
    /// Rejections caused by the request rather than by the service.
    pub fn is_validation(&self) -> bool {
        !matches!(self, SubmitError::Storage(_) | SubmitError::Dispatch(_))
    }
}

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("{0}")]
    NotFound(String),

    #[error("conversion is still {0:?}")]
    NotReady(PublicStatus),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submitted {
    pub job_id: String,
    pub status: PublicStatus,
    pub message: String,
}

/// Public view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub job_id: String,
    pub status: PublicStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    fn unobserved(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: PublicStatus::Pending,
            message: UNOBSERVED_MESSAGE.to_string(),
            progress: None,
            download_url: None,
            public_url: None,
            error: None,
        }
    }

    fn from_job(job: &Job) -> Self {
        let status = job.status.public();
        let completed = job.status == JobStatus::Completed;
        Self {
            job_id: job.id.clone(),
            status,
            message: job.public_message(),
            progress: (status == PublicStatus::Processing).then_some(job.progress),
            download_url: completed.then(|| download_path(&job.id)),
            public_url: if completed { job.public_url.clone() } else { None },
            error: if job.status == JobStatus::Failed {
                job.error.clone()
            } else {
                None
            },
        }
    }
}

/// An artifact ready to be sent to the client.
#[derive(Debug, Clone)]
pub struct Download {
    pub filename: String,
    pub media_type: &'static str,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportedFormats {
    pub conversions: Vec<ConversionPair>,
    pub max_file_size_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub storage_backend: String,
    pub storage: bool,
    pub broker: bool,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.storage && self.broker
    }
}

pub fn download_path(job_id: &str) -> String {
    format!("/api/download/{job_id}")
}

/// Client-facing filename for an artifact key.
pub fn download_filename(job_id: &str, key: &str) -> String {
    match extension_of(key) {
        Some(ext) if ext == ARCHIVE_EXTENSION => format!("converted_pages_{job_id}.{ARCHIVE_EXTENSION}"),
        Some(ext) => format!("converted_{job_id}.{ext}"),
        None => format!("converted_{job_id}"),
    }
}

pub struct ConversionService {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    broker: Arc<dyn Broker>,
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn StorageBackend>,
    resolver: ArtifactResolver,
    max_upload_bytes: u64,
}

impl ConversionService {
    pub fn new(
        registry: Arc<Registry>,
        broker: Arc<dyn Broker>,
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn StorageBackend>,
        resolver: ArtifactResolver,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            registry,
            dispatcher: Dispatcher::new(broker.clone(), jobs.clone()),
            broker,
            jobs,
            storage,
            resolver,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Validates the request and the payload, stores the upload and
    /// dispatches a new job. Nothing touches the queue until every check
    /// has passed.
    pub async fn submit(
        &self,
        filename: &str,
        from_format: &str,
        to_format: &str,
        data: &[u8],
    ) -> Result<Submitted, SubmitError> {
        let pair = ConversionPair::parse(from_format, to_format)?;
        self.registry.kind_of(pair)?;

        let matches = extension_of(filename).is_some_and(|ext| pair.from.matches_extension(&ext));
        if !matches {
            return Err(SubmitError::ExtensionMismatch {
                filename: filename.to_string(),
                declared: pair.from,
            });
        }

        let size = data.len() as u64;
        if size == 0 {
            return Err(SubmitError::Empty);
        }
        if size > self.max_upload_bytes {
            return Err(SubmitError::TooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }

        let job_id = Uuid::new_v4().to_string();
        let key = input_key(&job_id, pair.from);
        let local = self.resolver.local_path(&key);
        self.store_upload(&local, &key, data).await?;

        let mut job = Job::with_id(job_id, pair, QueueName::for_pair(pair), key);
        if let Err(err) = self.dispatcher.dispatch(&mut job).await {
            return Err(SubmitError::Dispatch(err));
        }

        info!(job_id = %job.id, pair = %pair, bytes = size, "Accepted conversion request");
        Ok(Submitted {
            job_id: job.id,
            status: PublicStatus::Pending,
            message: "File uploaded successfully. Conversion in progress.".to_string(),
        })
    }

    async fn store_upload(&self, local: &Path, key: &str, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;

        if self.storage.kind().is_remote() {
            if let Err(err) = self.storage.upload(local, key).await {
                if let Err(e) = tokio::fs::remove_file(local).await {
                    warn!(path = %local.display(), error = %e, "Failed to remove scratch copy of rejected upload");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Last known state of a job. Unknown ids read as queued.
    pub async fn status(&self, job_id: &str) -> anyhow::Result<StatusReport> {
        let job = self
            .jobs
            .load(job_id)
            .await
            .with_context(|| format!("Failed to read status of job {job_id}"))?;

        Ok(match job {
            Some(job) => StatusReport::from_job(&job),
            None => StatusReport::unobserved(job_id),
        })
    }

    /// The artifact of a completed job, fetched from the backend into the
    /// scratch area first if it is not there.
    pub async fn retrieve(&self, job_id: &str) -> Result<Download, RetrieveError> {
        let job = self
            .jobs
            .load(job_id)
            .await
            .map_err(|err| RetrieveError::Internal(format!("{err:#}")))?
            .ok_or_else(|| RetrieveError::NotFound(format!("job {job_id} not found")))?;

        let key = match job.status {
            JobStatus::Completed => job.output_path.clone().ok_or_else(|| {
                RetrieveError::Internal(format!("job {job_id} is completed but has no artifact"))
            })?,
            JobStatus::Failed => {
                return Err(RetrieveError::NotFound(format!(
                    "job {job_id} did not complete: {}",
                    job.error.as_deref().unwrap_or("unknown error")
                )))
            }
            other => return Err(RetrieveError::NotReady(other.public())),
        };

        let local = self.resolver.local_path(&key);
        self.ensure_local(&key, &local).await?;

        let data = tokio::fs::read(&local)
            .await
            .map_err(|err| RetrieveError::Internal(format!("failed to read artifact {key}: {err}")))?;

        Ok(Download {
            filename: download_filename(job_id, &key),
            media_type: media_type_for_path(&key),
            data: Bytes::from(data),
        })
    }

    async fn ensure_local(&self, key: &str, local: &Path) -> Result<(), RetrieveError> {
        if tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Ok(());
        }
        // The retention sweep may have removed the artifact while the job
        // record is still alive.
        let expired = || RetrieveError::NotFound("Converted file not found; it may have expired".to_string());
        if !self.storage.kind().is_remote() {
            warn!(key, "Artifact of completed job is gone from storage");
            return Err(expired());
        }
        match self.storage.download(key, local).await {
            Ok(message) => {
                info!(key, message = %message, "Fetched artifact from storage");
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                warn!(key, "Artifact of completed job is gone from storage");
                Err(expired())
            }
            Err(err) => {
                warn!(key, error = %err, "Failed to fetch artifact from storage");
                Err(RetrieveError::Internal(format!("artifact {key} is unavailable: {err}")))
            }
        }
    }

    pub fn formats(&self) -> SupportedFormats {
        SupportedFormats {
            conversions: self.registry.pairs().collect(),
            max_file_size_mb: self.max_upload_bytes / (1024 * 1024),
        }
    }

    /// Checks that the storage backend and the broker answer.
    pub async fn health(&self) -> Health {
        let storage = match self.storage.exists("outputs/.health").await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "Storage health check failed");
                false
            }
        };
        let broker = match self.broker.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Broker health check failed");
                false
            }
        };

        Health {
            status: if storage && broker { "healthy" } else { "unhealthy" },
            storage_backend: self.storage.kind().to_string(),
            storage,
            broker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::queue::MemoryQueue;
    use crate::storage::{LocalStorage, ObjectStorage};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        queue: Arc<MemoryQueue>,
        service: ConversionService,
    }

    fn fixture_with(storage: Option<Arc<dyn StorageBackend>>) -> Fixture {
        let root = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let service = ConversionService::new(
            Arc::new(Registry::new(&ToolConfig::default())),
            queue.clone(),
            queue.clone(),
            storage.unwrap_or_else(|| Arc::new(LocalStorage::new(root.path()))),
            ArtifactResolver::new(root.path()),
            1024,
        );
        Fixture { root, queue, service }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    #[tokio::test]
    async fn test_submit_routes_and_records() {
        let f = fixture();
        let submitted = f.service.submit("report.XLSX", "xlsx", "PDF", b"sheet").await.unwrap();

        assert_eq!(submitted.status, PublicStatus::Pending);
        assert_eq!(f.queue.pending(QueueName::Spreadsheet).await, vec![submitted.job_id.clone()]);
        let stored = f
            .root
            .path()
            .join(format!("uploads/{}_input.xlsx", submitted.job_id));
        assert_eq!(std::fs::read(stored).unwrap(), b"sheet");
    }

    #[tokio::test]
    async fn test_jpeg_extension_matches_jpg_format() {
        let f = fixture();
        assert!(f.service.submit("photo.jpeg", "jpg", "pdf", b"img").await.is_ok());
        assert!(f.service.submit("photo.JPG", "jpeg", "pdf", b"img").await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_validation_happens_before_queueing() {
        let f = fixture();
        let cases = [
            ("a.docx", "docx", "xlsx", &b"x"[..]),
            ("a.docx", "rtf", "pdf", &b"x"[..]),
            ("a.pdf", "docx", "pdf", &b"x"[..]),
            ("noext", "docx", "pdf", &b"x"[..]),
            ("a.docx", "docx", "pdf", &b""[..]),
            ("a.docx", "docx", "pdf", &[0u8; 2048][..]),
        ];
        for (filename, from, to, data) in cases {
            let err = f.service.submit(filename, from, to, data).await.unwrap_err();
            assert!(err.is_validation(), "{filename} {from}->{to}: {err}");
        }

        for queue in QueueName::ALL {
            assert_eq!(f.queue.queue_length(queue).await.unwrap(), 0);
        }
        assert!(!f.root.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_unknown_job_reads_as_queued() {
        let f = fixture();
        let report = f.service.status("never-seen").await.unwrap();
        assert_eq!(report.status, PublicStatus::Pending);
        assert_eq!(report.message, UNOBSERVED_MESSAGE);
    }

    #[tokio::test]
    async fn test_status_projection() {
        let f = fixture();
        let submitted = f.service.submit("a.png", "png", "pdf", b"png").await.unwrap();
        let mut job = f.queue.load(&submitted.job_id).await.unwrap().unwrap();

        job.start().unwrap();
        job.mark_converting(50, "Converting png to pdf...").unwrap();
        f.queue.save(&job).await.unwrap();
        let report = f.service.status(&job.id).await.unwrap();
        assert_eq!(report.status, PublicStatus::Processing);
        assert_eq!(report.progress, Some(50));
        assert_eq!(report.message, "Converting png to pdf... (50%)");
        assert!(matches!(
            f.service.retrieve(&job.id).await,
            Err(RetrieveError::NotReady(PublicStatus::Processing))
        ));

        job.mark_complete(format!("outputs/{}_output.pdf", job.id), Some("https://cdn/x".into()))
            .unwrap();
        f.queue.save(&job).await.unwrap();
        let report = f.service.status(&job.id).await.unwrap();
        assert_eq!(report.status, PublicStatus::Completed);
        assert_eq!(report.download_url, Some(format!("/api/download/{}", job.id)));
        assert_eq!(report.public_url.as_deref(), Some("https://cdn/x"));
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn test_retrieve_completed_artifact() {
        let f = fixture();
        let submitted = f.service.submit("a.pdf", "pdf", "png", b"%PDF").await.unwrap();
        let mut job = f.queue.load(&submitted.job_id).await.unwrap().unwrap();
        let key = format!("outputs/{}_output.zip", job.id);
        std::fs::create_dir_all(f.root.path().join("outputs")).unwrap();
        std::fs::write(f.root.path().join(&key), b"PK").unwrap();
        job.start().unwrap();
        job.mark_complete(key, None).unwrap();
        f.queue.save(&job).await.unwrap();

        let download = f.service.retrieve(&job.id).await.unwrap();
        assert_eq!(download.media_type, "application/zip");
        assert_eq!(download.filename, format!("converted_pages_{}.zip", job.id));
        assert_eq!(&download.data[..], b"PK");
    }

    #[tokio::test]
    async fn test_retrieve_failed_or_unknown_is_not_found() {
        let f = fixture();
        assert!(matches!(f.service.retrieve("nope").await, Err(RetrieveError::NotFound(_))));

        let submitted = f.service.submit("a.docx", "docx", "pdf", b"doc").await.unwrap();
        let mut job = f.queue.load(&submitted.job_id).await.unwrap().unwrap();
        job.start().unwrap();
        job.mark_failed("soffice crashed").unwrap();
        f.queue.save(&job).await.unwrap();

        assert!(matches!(f.service.retrieve(&job.id).await, Err(RetrieveError::NotFound(_))));
        let report = f.service.status(&job.id).await.unwrap();
        assert_eq!(report.status, PublicStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("soffice crashed"));
    }

    #[tokio::test]
    async fn test_swept_artifact_of_completed_job_is_not_found() {
        let f = fixture();
        let submitted = f.service.submit("a.docx", "docx", "pdf", b"doc").await.unwrap();
        let mut job = f.queue.load(&submitted.job_id).await.unwrap().unwrap();
        job.start().unwrap();
        job.mark_complete(format!("outputs/{}_output.pdf", job.id), None).unwrap();
        f.queue.save(&job).await.unwrap();

        let err = f.service.retrieve(&job.id).await.unwrap_err();
        assert!(matches!(err, RetrieveError::NotFound(_)), "{err:?}");
        assert_eq!(err.to_string(), "Converted file not found; it may have expired");
        assert_eq!(f.service.status(&job.id).await.unwrap().status, PublicStatus::Completed);
    }

    #[tokio::test]
    async fn test_swept_remote_artifact_is_not_found() {
        let remote: Arc<dyn StorageBackend> = Arc::new(ObjectStorage::in_memory());
        let f = fixture_with(Some(remote));
        let submitted = f.service.submit("a.docx", "docx", "pdf", b"doc").await.unwrap();
        let mut job = f.queue.load(&submitted.job_id).await.unwrap().unwrap();
        job.start().unwrap();
        job.mark_complete(format!("outputs/{}_output.pdf", job.id), None).unwrap();
        f.queue.save(&job).await.unwrap();

        assert!(matches!(f.service.retrieve(&job.id).await, Err(RetrieveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remote_artifact_is_fetched_on_download() {
        let remote: Arc<dyn StorageBackend> = Arc::new(ObjectStorage::in_memory());
        let f = fixture_with(Some(remote.clone()));
        let submitted = f.service.submit("a.docx", "docx", "pdf", b"doc").await.unwrap();
        assert!(remote.exists(&format!("uploads/{}_input.docx", submitted.job_id)).await.unwrap());

        let mut job = f.queue.load(&submitted.job_id).await.unwrap().unwrap();
        let key = format!("outputs/{}_output.pdf", job.id);
        let scratch = TempDir::new().unwrap();
        let produced = scratch.path().join("out.pdf");
        std::fs::write(&produced, b"%PDF-remote").unwrap();
        remote.upload(&produced, &key).await.unwrap();
        job.start().unwrap();
        job.mark_complete(key, None).unwrap();
        f.queue.save(&job).await.unwrap();

        let download = f.service.retrieve(&job.id).await.unwrap();
        assert_eq!(&download.data[..], b"%PDF-remote");
        assert_eq!(download.filename, format!("converted_{}.pdf", job.id));
        assert_eq!(download.media_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_formats_and_health() {
        let f = fixture();
        let formats = f.service.formats();
        assert_eq!(formats.conversions.len(), 10);

        let health = f.service.health().await;
        assert!(health.is_healthy());
        assert_eq!(health.status, "healthy");
        assert_eq!(health.storage_backend, "local");
    }

    #[test]
    fn test_download_filenames() {
        assert_eq!(download_filename("a", "outputs/a_output.pdf"), "converted_a.pdf");
        assert_eq!(download_filename("a", "outputs/a_output.zip"), "converted_pages_a.zip");
    }
}
