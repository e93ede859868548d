//! In-process broker and job store for standalone mode and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Broker, Delivery, JobStore, QueueName};
use crate::job::Job;

#[derive(Default)]
struct State {
    queues: HashMap<QueueName, VecDeque<String>>,
    in_flight: HashMap<(QueueName, String), Vec<String>>,
    scheduled: Vec<(Instant, QueueName, String)>,
    jobs: HashMap<String, (Job, Instant)>,
    leases: HashMap<(QueueName, String), Instant>,
}

/// Same contract as [`RedisQueue`](super::RedisQueue), held in memory.
/// Nothing survives the process.
pub struct MemoryQueue {
    state: Mutex<State>,
    published: Notify,
    result_ttl: Duration,
}

impl MemoryQueue {
    pub fn new(result_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            published: Notify::new(),
            result_ttl,
        }
    }

    /// Ids still waiting in `queue`, head first.
    pub async fn pending(&self, queue: QueueName) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .queues
            .get(&queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of scheduled retries not yet promoted.
    pub async fn scheduled_len(&self) -> usize {
        self.state.lock().await.scheduled.len()
    }

    #[cfg(test)]
    async fn stored_records(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    async fn try_claim(&self, queue: QueueName, consumer: &str) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let job_id = state.queues.get_mut(&queue)?.pop_front()?;
        state
            .in_flight
            .entry((queue, consumer.to_string()))
            .or_default()
            .push(job_id.clone());
        Some(Delivery {
            queue,
            consumer: consumer.to_string(),
            job_id,
        })
    }
}

#[async_trait]
impl Broker for MemoryQueue {
    async fn publish(&self, queue: QueueName, job_id: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .entry(queue)
            .or_default()
            .push_back(job_id.to_string());
        self.published.notify_waiters();

        debug!(job_id, queue = %queue, "Published job");
        Ok(())
    }

    async fn claim(&self, queue: QueueName, consumer: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking so a publish in between is not missed.
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            if let Some(delivery) = self.try_claim(queue, consumer).await {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (delivery.queue, delivery.consumer.clone());
        let removed = match state.in_flight.get_mut(&key) {
            Some(entries) => match entries.iter().position(|id| *id == delivery.job_id) {
                Some(index) => {
                    entries.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        };
        if !removed {
            warn!(job_id = %delivery.job_id, consumer = %delivery.consumer, "Acknowledged job was not in flight");
        }
        Ok(())
    }

    async fn schedule(&self, queue: QueueName, job_id: &str, delay: Duration) -> Result<()> {
        self.state
            .lock()
            .await
            .scheduled
            .push((Instant::now() + delay, queue, job_id.to_string()));
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize> {
        let now = Instant::now();
        let promoted = {
            let mut state = self.state.lock().await;
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
                .into_iter()
                .partition(|(at, _, _)| *at <= now);
            state.scheduled = waiting;
            for (_, queue, job_id) in &due {
                state.queues.entry(*queue).or_default().push_back(job_id.clone());
            }
            due.len()
        };

        if promoted > 0 {
            self.published.notify_waiters();
        }
        Ok(promoted)
    }

    async fn recover(&self, queue: QueueName, consumer: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let stranded = state
            .in_flight
            .remove(&(queue, consumer.to_string()))
            .unwrap_or_default();
        let count = stranded.len();
        let pending = state.queues.entry(queue).or_default();
        for job_id in stranded.into_iter().rev() {
            pending.push_front(job_id);
        }
        drop(state);

        if count > 0 {
            self.published.notify_waiters();
        }
        Ok(count)
    }

    async fn keep_alive(&self, queue: QueueName, consumer: &str, ttl: Duration) -> Result<()> {
        self.state
            .lock()
            .await
            .leases
            .insert((queue, consumer.to_string()), Instant::now() + ttl);
        Ok(())
    }

    async fn reap_orphans(&self, queue: QueueName) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let State {
            queues,
            in_flight,
            leases,
            ..
        } = &mut *state;

        leases.retain(|_, expires| *expires > now);
        let orphaned: Vec<(QueueName, String)> = in_flight
            .keys()
            .filter(|key| key.0 == queue && !leases.contains_key(*key))
            .cloned()
            .collect();

        let pending = queues.entry(queue).or_default();
        let mut reaped = 0;
        for key in orphaned {
            let stranded = in_flight.remove(&key).unwrap_or_default();
            if !stranded.is_empty() {
                warn!(queue = %queue, consumer = %key.1, moved = stranded.len(), "Reaped jobs from expired consumer");
            }
            reaped += stranded.len();
            for job_id in stranded.into_iter().rev() {
                pending.push_front(job_id);
            }
        }
        drop(state);

        if reaped > 0 {
            self.published.notify_waiters();
        }
        Ok(reaped)
    }

    async fn queue_length(&self, queue: QueueName) -> Result<usize> {
        Ok(self.state.lock().await.queues.get(&queue).map_or(0, VecDeque::len))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryQueue {
    async fn save(&self, job: &Job) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        // Records nobody reads again would otherwise stay until the process exits.
        state.jobs.retain(|_, (_, expires)| *expires > now);
        state
            .jobs
            .insert(job.id.clone(), (job.clone(), now + self.result_ttl));
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        match state.jobs.get(job_id) {
            Some((_, expires)) if *expires <= Instant::now() => {
                state.jobs.remove(job_id);
                Ok(None)
            }
            Some((job, _)) => Ok(Some(job.clone())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ConversionPair, Format};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn job() -> Job {
        Job::new(
            ConversionPair::new(Format::Pdf, Format::Png),
            QueueName::Image,
            "uploads/x_input.pdf".to_string(),
        )
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_deferred_ack() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.publish(QueueName::Image, "a").await.unwrap();
        queue.publish(QueueName::Image, "b").await.unwrap();

        let first = queue
            .claim(QueueName::Image, "w1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job_id, "a");
        assert_eq!(queue.queue_length(QueueName::Image).await.unwrap(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.recover(QueueName::Image, "w1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let claimed = queue
            .claim(QueueName::Document, "w1", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_waiting_claim_wakes_on_publish() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .claim(QueueName::Spreadsheet, "w1", Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(QueueName::Spreadsheet, "late").await.unwrap();

        let delivery = waiter.await.unwrap().unwrap();
        assert_eq!(delivery.job_id, "late");
    }

    #[tokio::test]
    async fn test_unacknowledged_entries_are_recovered() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.publish(QueueName::Image, "a").await.unwrap();
        queue.publish(QueueName::Image, "b").await.unwrap();
        queue.claim(QueueName::Image, "w1", Duration::ZERO).await.unwrap();

        assert_eq!(queue.recover(QueueName::Image, "w1").await.unwrap(), 1);
        assert_eq!(queue.pending(QueueName::Image).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_scheduled_entries_wait_for_their_delay() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.schedule(QueueName::Image, "now", Duration::ZERO).await.unwrap();
        queue.schedule(QueueName::Image, "later", Duration::from_secs(3600)).await.unwrap();

        assert_eq!(queue.promote_due().await.unwrap(), 1);
        assert_eq!(queue.pending(QueueName::Image).await, vec!["now"]);
        assert_eq!(queue.scheduled_len().await, 1);
    }

    #[tokio::test]
    async fn test_job_records_expire() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        let job = job();
        queue.save(&job).await.unwrap();
        assert_eq!(queue.load(&job.id).await.unwrap(), Some(job.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.load(&job.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_records_are_evicted_on_write() {
        let queue = MemoryQueue::new(Duration::from_millis(10));
        for _ in 0..5 {
            queue.save(&job()).await.unwrap();
        }
        assert_eq!(queue.stored_records().await, 5);

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.save(&job()).await.unwrap();
        assert_eq!(queue.stored_records().await, 1);
    }

    #[tokio::test]
    async fn test_orphans_return_only_from_dead_consumers() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        for id in ["a", "b", "c"] {
            queue.publish(QueueName::Image, id).await.unwrap();
        }
        queue.keep_alive(QueueName::Image, "live-image-0", Duration::from_secs(30)).await.unwrap();
        queue.keep_alive(QueueName::Image, "gone-image-0", Duration::from_millis(10)).await.unwrap();
        queue.claim(QueueName::Image, "live-image-0", Duration::ZERO).await.unwrap();
        queue.claim(QueueName::Image, "gone-image-0", Duration::ZERO).await.unwrap();

        // Both leases hold: nothing to reap yet.
        assert_eq!(queue.reap_orphans(QueueName::Image).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.reap_orphans(QueueName::Image).await.unwrap(), 1);
        assert_eq!(queue.pending(QueueName::Image).await, vec!["b", "c"]);
        assert_eq!(queue.recover(QueueName::Image, "live-image-0").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consumer_without_lease_is_orphaned() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.publish(QueueName::Document, "a").await.unwrap();
        queue.claim(QueueName::Document, "never-leased", Duration::ZERO).await.unwrap();

        assert_eq!(queue.reap_orphans(QueueName::Spreadsheet).await.unwrap(), 0);
        assert_eq!(queue.reap_orphans(QueueName::Document).await.unwrap(), 1);
        assert_eq!(queue.pending(QueueName::Document).await, vec!["a"]);
    }
}
