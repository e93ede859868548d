//! Redis-backed broker and job store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ::redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{scheduled_member, Broker, Delivery, JobStore, QueueName, UnreadableRecord};
use crate::job::Job;

/// Queue list prefix; the full key is `convert:queue:<name>`.
const QUEUE_KEY_PREFIX: &str = "convert:queue";

/// Sorted set of scheduled retries, scored by due time in milliseconds.
const DELAYED_KEY: &str = "convert:delayed";

const JOB_KEY_PREFIX: &str = "convert:job";

/// Consumer lease prefix; the full key is `convert:lease:<queue>:<consumer>`.
const LEASE_KEY_PREFIX: &str = "convert:lease";

/// Upper bound on scheduled entries promoted per call.
const PROMOTE_BATCH: isize = 100;

fn queue_key(queue: QueueName) -> String {
    format!("{QUEUE_KEY_PREFIX}:{queue}")
}

fn processing_key(queue: QueueName, consumer: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}:{queue}:processing:{consumer}")
}

/// Set of consumers that have claimed from `queue`, for the reaper.
fn consumers_key(queue: QueueName) -> String {
    format!("{QUEUE_KEY_PREFIX}:{queue}:consumers")
}

fn lease_key(queue: QueueName, consumer: &str) -> String {
    format!("{LEASE_KEY_PREFIX}:{queue}:{consumer}")
}

/// Pops due entries off the delayed set and pushes them onto their queues in
/// one atomic step. Entries naming an unknown queue are dropped.
///
/// KEYS[1] delayed set; ARGV[1] now in ms, ARGV[2] batch size, ARGV[3] queue
/// key prefix, ARGV[4..] known queue names.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local known = {}
for i = 4, #ARGV do
  known[ARGV[i]] = true
end
local promoted = 0
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  local sep = string.find(member, ':', 1, true)
  if sep then
    local queue = string.sub(member, 1, sep - 1)
    if known[queue] then
      redis.call('RPUSH', ARGV[3] .. ':' .. queue, string.sub(member, sep + 1))
      promoted = promoted + 1
    end
  end
end
return promoted
";

fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}:{job_id}")
}

/// Job queue and result store on a single Redis connection.
///
/// Jobs are ids in Redis lists. A claim moves the id into the consumer's
/// in-flight list with `BLMOVE`, and the acknowledgement removes it from
/// there. Job records are JSON with a TTL.
///
/// `claim` blocks the underlying connection while it waits, so each consumer
/// loop should own its own `RedisQueue`.
#[derive(Clone)]
pub struct RedisQueue {
    /// Redis connection manager for async operations.
    pub conn: ConnectionManager,
    result_ttl: Duration,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, result_ttl: Duration) -> Self {
        Self { conn, result_ttl }
    }

    /// Opens a new managed connection to `url`.
    pub async fn connect(url: &str, result_ttl: Duration) -> Result<Self> {
        let client = ::redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn, result_ttl))
    }

    /// Moves every entry in `consumer`'s in-flight list back to the head of
    /// the queue, oldest claim first out.
    async fn drain_in_flight(&self, queue: QueueName, consumer: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let processing = processing_key(queue, consumer);
        let mut moved_back = 0;

        loop {
            let moved: Option<String> = ::redis::cmd("LMOVE")
                .arg(&processing)
                .arg(queue_key(queue))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .context("Failed to move in-flight job back to queue")?;
            match moved {
                Some(job_id) => {
                    warn!(job_id = %job_id, queue = %queue, consumer, "Returned unacknowledged job to queue");
                    moved_back += 1;
                }
                None => break,
            }
        }
        Ok(moved_back)
    }
}

#[async_trait]
impl Broker for RedisQueue {
    async fn publish(&self, queue: QueueName, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue_key(queue), job_id)
            .await
            .context("Failed to push job to queue")?;

        debug!(job_id, queue = %queue, "Published job");
        Ok(())
    }

    async fn claim(&self, queue: QueueName, consumer: &str, wait: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(consumers_key(queue), consumer)
            .await
            .context("Failed to register consumer")?;

        let job_id: Option<String> = ::redis::cmd("BLMOVE")
            .arg(queue_key(queue))
            .arg(processing_key(queue, consumer))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await
            .context("Failed to claim job from queue")?;

        Ok(job_id.map(|job_id| {
            debug!(job_id = %job_id, queue = %queue, consumer, "Claimed job");
            Delivery {
                queue,
                consumer: consumer.to_string(),
                job_id,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .lrem(processing_key(delivery.queue, &delivery.consumer), 1, &delivery.job_id)
            .await
            .context("Failed to acknowledge job")?;

        if removed == 0 {
            warn!(job_id = %delivery.job_id, consumer = %delivery.consumer, "Acknowledged job was not in flight");
        }
        Ok(())
    }

    async fn schedule(&self, queue: QueueName, job_id: &str, delay: Duration) -> Result<()> {
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, scheduled_member(queue, job_id), due)
            .await
            .context("Failed to schedule job retry")?;

        debug!(job_id, queue = %queue, delay_secs = delay.as_secs(), "Scheduled job retry");
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();

        let script = ::redis::Script::new(PROMOTE_SCRIPT);
        let mut invocation = script.key(DELAYED_KEY);
        invocation.arg(now).arg(PROMOTE_BATCH).arg(QUEUE_KEY_PREFIX);
        for queue in QueueName::ALL {
            invocation.arg(queue.as_str());
        }
        let promoted: usize = invocation
            .invoke_async(&mut conn)
            .await
            .context("Failed to promote scheduled jobs")?;

        if promoted > 0 {
            info!(promoted, "Promoted scheduled jobs");
        }
        Ok(promoted)
    }

    async fn recover(&self, queue: QueueName, consumer: &str) -> Result<usize> {
        self.drain_in_flight(queue, consumer).await
    }

    async fn keep_alive(&self, queue: QueueName, consumer: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(lease_key(queue, consumer), 1, ttl.as_secs().max(1))
            .await
            .context("Failed to refresh consumer lease")?;
        Ok(())
    }

    async fn reap_orphans(&self, queue: QueueName) -> Result<usize> {
        let mut conn = self.conn.clone();
        let consumers: Vec<String> = conn
            .smembers(consumers_key(queue))
            .await
            .context("Failed to list consumers")?;

        let mut reaped = 0;
        for consumer in consumers {
            let alive: bool = conn
                .exists(lease_key(queue, &consumer))
                .await
                .context("Failed to check consumer lease")?;
            if alive {
                continue;
            }

            let moved = self.drain_in_flight(queue, &consumer).await?;
            // A consumer that comes back registers itself again on its next claim.
            conn.srem::<_, _, ()>(consumers_key(queue), &consumer)
                .await
                .context("Failed to forget consumer")?;
            if moved > 0 {
                warn!(queue = %queue, consumer = %consumer, moved, "Reaped jobs from expired consumer");
            }
            reaped += moved;
        }
        Ok(reaped)
    }

    async fn queue_length(&self, queue: QueueName) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .llen(queue_key(queue))
            .await
            .context("Failed to get queue length")?;
        Ok(len)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("Redis did not answer PING")?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisQueue {
    async fn save(&self, job: &Job) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job")?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(job_key(&job.id), &job_json, self.result_ttl.as_secs())
            .await
            .context("Failed to store job record")?;

        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "Stored job record");
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let job_json: Option<String> = conn
            .get(job_key(job_id))
            .await
            .context("Failed to read job record")?;

        let Some(json) = job_json else {
            return Ok(None);
        };
        let job = serde_json::from_str(&json).map_err(|e| UnreadableRecord {
            job_id: job_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(job))
    }
}
