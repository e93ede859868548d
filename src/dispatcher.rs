//! Submission side of the task dispatcher: record the job, then enqueue it.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use crate::job::Job;
use crate::queue::{Broker, JobStore, QueueName};

/// Puts new jobs on the queue matching their conversion family.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    jobs: Arc<dyn JobStore>,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, jobs: Arc<dyn JobStore>) -> Self {
        Self { broker, jobs }
    }

    /// Stores the PENDING record and publishes the job on `job.queue`.
    ///
    /// The record is written first so a worker that claims the job
    /// immediately always finds it. If publishing fails the record is marked
    /// FAILED so it does not sit in PENDING forever.
    pub async fn dispatch(&self, job: &mut Job) -> Result<()> {
        debug_assert_eq!(job.queue, QueueName::for_pair(job.pair()));

        self.jobs
            .save(job)
            .await
            .context("Failed to record job before dispatch")?;

        if let Err(err) = self.broker.publish(job.queue, &job.id).await {
            error!(job_id = %job.id, queue = %job.queue, error = %err, "Failed to enqueue job");
            if job.mark_failed(format!("failed to enqueue job: {err:#}")).is_ok() {
                if let Err(save_err) = self.jobs.save(job).await {
                    error!(job_id = %job.id, error = %save_err, "Failed to record dispatch failure");
                }
            }
            return Err(err.context("Failed to enqueue job"));
        }

        info!(
            job_id = %job.id,
            pair = %job.pair(),
            queue = %job.queue,
            "Enqueued job"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ConversionPair, Format};
    use crate::job::JobStatus;
    use crate::queue::MemoryQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatch_records_then_enqueues() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(queue.clone(), queue.clone());

        let pair = ConversionPair::new(Format::Xlsx, Format::Pdf);
        let mut job = Job::new(pair, QueueName::for_pair(pair), "uploads/x_input.xlsx".into());
        dispatcher.dispatch(&mut job).await.unwrap();

        assert_eq!(queue.pending(QueueName::Spreadsheet).await, vec![job.id.clone()]);
        assert_eq!(queue.pending(QueueName::Document).await, Vec::<String>::new());

        let stored = queue.load(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }
}
