//! Named job queues, the broker contract and the job record store.
//!
//! Queue entries carry only the job id; the job itself lives in the
//! [`JobStore`]. A claimed entry stays in the consumer's in-flight list until
//! it is acknowledged, so a worker that dies mid-job leaves the entry behind
//! for [`Broker::recover`] or [`Broker::reap_orphans`] instead of losing it.

mod memory;
mod redis;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::format::{ConversionPair, Family};
use crate::job::Job;

/// Queues are split by conversion family so slow work on one family does
/// not starve the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Document,
    Spreadsheet,
    Image,
    Default,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Document,
        QueueName::Spreadsheet,
        QueueName::Image,
        QueueName::Default,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Document => "document",
            QueueName::Spreadsheet => "spreadsheet",
            QueueName::Image => "image",
            QueueName::Default => "default",
        }
    }

    /// Routes a conversion pair to its queue.
    pub fn for_pair(pair: ConversionPair) -> Self {
        match (pair.from.family(), pair.to.family()) {
            (Family::Document, Family::Pdf) | (Family::Pdf, Family::Document) => QueueName::Document,
            (Family::Spreadsheet, Family::Pdf) => QueueName::Spreadsheet,
            (Family::Image, Family::Pdf) | (Family::Pdf, Family::Image) => QueueName::Image,
            _ => QueueName::Default,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        QueueName::ALL
            .into_iter()
            .find(|queue| queue.as_str() == name)
            .ok_or_else(|| format!("unknown queue '{s}' (expected document, spreadsheet, image or default)"))
    }
}

/// A claimed queue entry. Must be passed back to [`Broker::ack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: QueueName,
    pub consumer: String,
    pub job_id: String,
}

/// Work distribution with deferred acknowledgement.
///
/// Every consumer holds a lease while it is alive. Entries claimed by a
/// consumer whose lease has lapsed are orphans, and [`Broker::reap_orphans`]
/// hands them back to the queue so that any live consumer can finish them.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a job to the tail of `queue`.
    async fn publish(&self, queue: QueueName, job_id: &str) -> Result<()>;

    /// Claims the next job, waiting up to `wait` for one to arrive.
    ///
    /// The claimed entry moves into `consumer`'s in-flight list and stays
    /// there until it is acknowledged.
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue to claim from
    /// * `consumer` - Name of the claiming consumer, unique per process and loop
    /// * `wait` - How long to block for an entry; zero polls once
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(delivery))` when an entry was claimed, `Ok(None)` when
    /// the wait elapsed with the queue empty, or an error if the broker fails.
    async fn claim(&self, queue: QueueName, consumer: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Drops a claimed entry once its job is terminal or rescheduled.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Re-publishes `job_id` on `queue` once `delay` has elapsed.
    async fn schedule(&self, queue: QueueName, job_id: &str, delay: Duration) -> Result<()>;

    /// Moves scheduled jobs whose delay has elapsed back onto their queues.
    ///
    /// Removal from the scheduled set and the push onto the queue happen as
    /// one step, so a failure cannot lose an entry.
    ///
    /// # Returns
    ///
    /// Returns the number of entries moved.
    async fn promote_due(&self) -> Result<usize>;

    /// Returns entries left in `consumer`'s in-flight list to the queue.
    ///
    /// Called by a consumer on start, for entries a previous run under the
    /// same name left behind.
    async fn recover(&self, queue: QueueName, consumer: &str) -> Result<usize>;

    /// Marks `consumer` as alive for `ttl`.
    ///
    /// Consumers refresh their lease well inside `ttl` for as long as they
    /// run, including while a job is executing.
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue the consumer claims from
    /// * `consumer` - Name of the consumer
    /// * `ttl` - How long the lease holds without another refresh
    async fn keep_alive(&self, queue: QueueName, consumer: &str, ttl: Duration) -> Result<()>;

    /// Returns entries held by consumers without a live lease to the head of
    /// `queue`.
    ///
    /// This covers consumers that died and never come back under the same
    /// name, for example after a scale-down or a change of worker id.
    ///
    /// # Returns
    ///
    /// Returns the number of entries moved back.
    async fn reap_orphans(&self, queue: QueueName) -> Result<usize>;

    async fn queue_length(&self, queue: QueueName) -> Result<usize>;

    async fn ping(&self) -> Result<()>;
}

/// TTL-bound job records. An expired record reads as absent.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Writes `job` and restarts its expiry.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Reads the record for `job_id`.
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` for an unknown or expired id. A record that exists
    /// but cannot be decoded is an error that downcasts to
    /// [`UnreadableRecord`]; any other error is a failure to reach the store.
    async fn load(&self, job_id: &str) -> Result<Option<Job>>;
}

/// A stored job record that no longer decodes. Retrying will not help.
#[derive(Debug, Error)]
#[error("job record {job_id} is unreadable: {reason}")]
pub struct UnreadableRecord {
    pub job_id: String,
    pub reason: String,
}

/// Encodes a scheduled entry as `<queue>:<job id>`.
fn scheduled_member(queue: QueueName, job_id: &str) -> String {
    format!("{queue}:{job_id}")
}
