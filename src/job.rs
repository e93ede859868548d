//! Conversion job record and its state machine.
//!
//! ```text
//! PENDING -> STARTED -> PROGRESS(n%) -> CONVERTING -> PROGRESS(n%) -> COMPLETED
//!    ^          |            |               |                  \--> FAILED
//!    \----------+------------+---------------/  (retry, bounded)
//! ```
//!
//! `COMPLETED` and `FAILED` are terminal. Re-entering `PENDING` through
//! [`Job::retry`] is the only backward transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::format::{ConversionPair, Format};
use crate::queue::QueueName;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, not yet claimed by a worker.
    Pending,
    Started,
    Progress,
    /// Converter running. Distinguished for observability only.
    Converting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Claimed by a worker and not yet finished.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Started | JobStatus::Progress | JobStatus::Converting)
    }

    pub fn public(self) -> PublicStatus {
        match self {
            JobStatus::Pending => PublicStatus::Pending,
            JobStatus::Started | JobStatus::Progress | JobStatus::Converting => PublicStatus::Processing,
            JobStatus::Completed => PublicStatus::Completed,
            JobStatus::Failed => PublicStatus::Failed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Started => write!(f, "STARTED"),
            JobStatus::Progress => write!(f, "PROGRESS"),
            JobStatus::Converting => write!(f, "CONVERTING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {job_id} is {status} and cannot {action}")]
    Illegal {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("progress cannot go backwards ({current}% -> {requested}%)")]
    Regressed { current: u8, requested: u8 },

    #[error("progress {0}% is out of range")]
    OutOfRange(u8),
}

/// One submitted conversion request and its lifecycle record.
///
/// Written only by the worker owning the current attempt; read by the status
/// and download paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub from_format: Format,
    pub to_format: Format,
    pub queue: QueueName,
    /// Backend-relative key of the uploaded input.
    pub input_path: String,
    /// Backend-relative key of the artifact; set only when completed.
    pub output_path: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    pub status_text: String,
    pub error: Option<String>,
    pub public_url: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(pair: ConversionPair, queue: QueueName, input_path: String) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), pair, queue, input_path)
    }

    pub fn with_id(id: String, pair: ConversionPair, queue: QueueName, input_path: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            from_format: pair.from,
            to_format: pair.to,
            queue,
            input_path,
            output_path: None,
            status: JobStatus::Pending,
            progress: 0,
            status_text: "Task is waiting in queue".to_string(),
            error: None,
            public_url: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn pair(&self) -> ConversionPair {
        ConversionPair::new(self.from_format, self.to_format)
    }

    fn illegal(&self, action: &'static str) -> TransitionError {
        TransitionError::Illegal {
            job_id: self.id.clone(),
            status: self.status,
            action,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// PENDING -> STARTED, on claim by a worker.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Pending {
            return Err(self.illegal("start"));
        }
        self.status = JobStatus::Started;
        self.progress = 0;
        self.status_text = "Starting conversion...".to_string();
        self.started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    fn advance(
        &mut self,
        status: JobStatus,
        percent: u8,
        text: String,
        action: &'static str,
    ) -> Result<(), TransitionError> {
        if !self.status.is_active() {
            return Err(self.illegal(action));
        }
        if percent > 100 {
            return Err(TransitionError::OutOfRange(percent));
        }
        if percent < self.progress {
            return Err(TransitionError::Regressed {
                current: self.progress,
                requested: percent,
            });
        }
        self.status = status;
        self.progress = percent;
        self.status_text = text;
        self.touch();
        Ok(())
    }

    /// Records a PROGRESS checkpoint. Progress never decreases within an attempt.
    pub fn report_progress(&mut self, percent: u8, text: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobStatus::Progress, percent, text.into(), "report progress")
    }

    /// Marks the converter as running.
    pub fn mark_converting(&mut self, percent: u8, text: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobStatus::Converting, percent, text.into(), "start converting")
    }

    pub fn mark_complete(&mut self, output_path: String, public_url: Option<String>) -> Result<(), TransitionError> {
        if !self.status.is_active() {
            return Err(self.illegal("complete"));
        }
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.status_text = "Conversion completed successfully".to_string();
        self.output_path = Some(output_path);
        self.public_url = public_url;
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.illegal("fail"));
        }
        let error = error.into();
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.status_text = "Conversion failed".to_string();
        self.output_path = None;
        self.error = Some(if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        });
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Sends the job back to PENDING for another attempt, or fails it for
    /// good once `max_retries` retries have been used. Returns whether a
    /// retry was scheduled; the last error is kept either way.
    pub fn retry(&mut self, max_retries: u32, last_error: impl Into<String>) -> Result<bool, TransitionError> {
        if self.status.is_terminal() {
            return Err(self.illegal("retry"));
        }
        let last_error = last_error.into();
        if self.retry_count < max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Pending;
            self.progress = 0;
            self.status_text = format!(
                "Retrying after failure (retry {} of {})",
                self.retry_count, max_retries
            );
            self.error = Some(last_error);
            self.touch();
            Ok(true)
        } else {
            self.mark_failed(last_error)?;
            Ok(false)
        }
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| done.signed_duration_since(self.created_at).num_milliseconds())
    }

    /// `completed_at` is set iff terminal; `output_path` is set iff completed.
    pub fn invariants_hold(&self) -> bool {
        self.completed_at.is_some() == self.status.is_terminal()
            && self.output_path.is_some() == (self.status == JobStatus::Completed)
            && self.progress <= 100
    }

    /// Human-readable message for the public status view.
    pub fn public_message(&self) -> String {
        match self.status {
            JobStatus::Pending => self.status_text.clone(),
            JobStatus::Started | JobStatus::Progress | JobStatus::Converting => {
                format!("{} ({}%)", self.status_text, self.progress)
            }
            JobStatus::Completed => "Conversion completed successfully".to_string(),
            JobStatus::Failed => "Conversion failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job() -> Job {
        Job::new(
            ConversionPair::new(Format::Xlsx, Format::Pdf),
            QueueName::Spreadsheet,
            "uploads/x_input.xlsx".to_string(),
        )
    }

    #[test]
    fn test_happy_path_keeps_invariants() {
        let mut job = job();
        let mut seen = vec![(job.status, job.progress)];
        assert!(job.invariants_hold());

        job.start().unwrap();
        seen.push((job.status, job.progress));
        job.report_progress(25, "Initializing converter...").unwrap();
        seen.push((job.status, job.progress));
        job.mark_converting(50, "Converting xlsx to pdf...").unwrap();
        seen.push((job.status, job.progress));
        job.report_progress(90, "Uploading...").unwrap();
        seen.push((job.status, job.progress));
        assert!(job.invariants_hold());
        job.mark_complete("outputs/x_output.pdf".into(), None).unwrap();
        seen.push((job.status, job.progress));

        assert!(job.invariants_hold());
        assert_eq!(
            seen,
            vec![
                (JobStatus::Pending, 0),
                (JobStatus::Started, 0),
                (JobStatus::Progress, 25),
                (JobStatus::Converting, 50),
                (JobStatus::Progress, 90),
                (JobStatus::Completed, 100),
            ]
        );
        assert!(job.processing_duration_ms().is_some());
    }

    #[test]
    fn test_progress_cannot_regress() {
        let mut job = job();
        job.start().unwrap();
        job.report_progress(50, "half").unwrap();
        assert_eq!(
            job.report_progress(25, "back"),
            Err(TransitionError::Regressed { current: 50, requested: 25 })
        );
        assert_eq!(job.report_progress(101, "over"), Err(TransitionError::OutOfRange(101)));
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut job = job();
        job.start().unwrap();
        job.mark_complete("outputs/x_output.pdf".into(), Some("https://cdn/x".into()))
            .unwrap();

        assert!(job.mark_failed("late").is_err());
        assert!(job.report_progress(100, "again").is_err());
        assert!(job.retry(3, "nope").is_err());
        assert_eq!(job.output_path.as_deref(), Some("outputs/x_output.pdf"));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_cannot_progress_before_start() {
        let mut job = job();
        assert!(matches!(
            job.report_progress(25, "early"),
            Err(TransitionError::Illegal { status: JobStatus::Pending, .. })
        ));
        assert!(job.mark_complete("outputs/x".into(), None).is_err());
    }

    #[test]
    fn test_failure_sets_error_and_completed_at() {
        let mut job = job();
        job.start().unwrap();
        job.mark_failed("").unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("unknown error"));
        assert!(job.invariants_hold());
        assert_eq!(job.status.public(), PublicStatus::Failed);
    }

    #[test]
    fn test_retry_is_bounded() {
        let mut job = job();
        for attempt in 1..=3 {
            job.start().unwrap();
            assert!(job.retry(3, format!("tool crashed #{attempt}")).unwrap());
            assert_eq!(job.retry_count, attempt);
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.progress, 0);
            assert!(job.invariants_hold());
        }

        job.start().unwrap();
        assert!(!job.retry(3, "tool crashed #4").unwrap());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error.as_deref(), Some("tool crashed #4"));
        assert!(job.invariants_hold());
    }

    #[test]
    fn test_public_projection() {
        let mut job = job();
        assert_eq!(job.status.public(), PublicStatus::Pending);

        job.start().unwrap();
        job.mark_converting(50, "Converting xlsx to pdf...").unwrap();
        assert_eq!(job.status.public(), PublicStatus::Processing);
        assert_eq!(job.public_message(), "Converting xlsx to pdf... (50%)");
    }

    #[test]
    fn test_serde_round_trip_uses_wire_names() {
        let job = job();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["from_format"], "xlsx");
        assert_eq!(json["queue"], "spreadsheet");
    }
}
