//! Execution side of the task dispatcher.
//!
//! Each worker loop consumes one queue:
//!
//! 1. Return anything left in its in-flight list by a previous run, then
//!    keep a lease alive for as long as the loop runs
//! 2. Hand back work held by consumers whose lease lapsed, and promote
//!    scheduled retries that are due
//! 3. Claim the next job and wait for the queue's rate ceiling
//! 4. Drive the job through its states while the converter runs under the
//!    soft and hard time limits
//! 5. Upload the artifact, then acknowledge once the job is terminal or
//!    rescheduled

use anyhow::Result;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactResolver;
use crate::config::{TaskLimits, WorkerConfig};
use crate::converter::{ConversionReport, Converter};
use crate::error::{ConvertError, ExecutionError};
use crate::job::{Job, JobStatus};
use crate::queue::{Broker, Delivery, JobStore, QueueName, UnreadableRecord};
use crate::registry::Registry;
use crate::storage::StorageBackend;
use crate::telemetry;

/// How long a claim waits for work before the loop comes round again.
pub const CLAIM_WAIT: Duration = Duration::from_secs(5);

/// Pause after a broker error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Heartbeat every this many processed jobs, and whenever the queue is idle.
const HEARTBEAT_EVERY: u64 = 10;

/// A consumer that has not refreshed its lease for this long is presumed dead.
const LEASE_TTL: Duration = Duration::from_secs(30);

const LEASE_REFRESH: Duration = Duration::from_secs(10);

/// How often a loop looks for work held by dead consumers.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Deliveries of one job whose record could not be read before it is dropped.
const MAX_LOAD_ATTEMPTS: u32 = 5;

/// A shared per-queue rate ceiling.
pub type QueueLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a rate limiter admitting `per_minute` jobs per minute.
pub fn queue_limiter(per_minute: u32) -> QueueLimiter {
    let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Everything a worker needs besides its queue connection.
pub struct WorkerContext {
    pub registry: Arc<Registry>,
    pub resolver: ArtifactResolver,
    pub storage: Arc<dyn StorageBackend>,
    pub limits: TaskLimits,
}

/// One consumer loop bound to a single queue.
pub struct Worker {
    ctx: Arc<WorkerContext>,
    broker: Arc<dyn Broker>,
    jobs: Arc<dyn JobStore>,
    queue: QueueName,
    consumer: String,
    limiter: QueueLimiter,
    /// Failed record reads per job id, for bounding redelivery.
    load_failures: Mutex<HashMap<String, u32>>,
}

impl Worker {
    pub fn new(
        ctx: Arc<WorkerContext>,
        broker: Arc<dyn Broker>,
        jobs: Arc<dyn JobStore>,
        queue: QueueName,
        consumer: impl Into<String>,
        limiter: QueueLimiter,
    ) -> Self {
        Self {
            ctx,
            broker,
            jobs,
            queue,
            consumer: consumer.into(),
            limiter,
            load_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Runs until `shutdown` fires. A job in progress is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.queue, consumer = %self.consumer, "Worker started");

        match self.broker.recover(self.queue, &self.consumer).await {
            Ok(0) => {}
            Ok(recovered) => warn!(queue = %self.queue, recovered, "Re-queued jobs left in flight by a previous run"),
            Err(e) => error!(queue = %self.queue, error = %e, "Failed to recover in-flight jobs"),
        }

        self.keep_alive().await;
        let lease = shutdown.child_token();
        let keeper = self.spawn_lease_keeper(lease.clone());

        self.reap().await;
        let mut last_reap = tokio::time::Instant::now();

        let mut processed: u64 = 0;
        loop {
            if last_reap.elapsed() >= REAP_INTERVAL {
                self.reap().await;
                last_reap = tokio::time::Instant::now();
            }

            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = self.claim_next(CLAIM_WAIT) => claimed,
            };

            match claimed {
                Ok(Some(delivery)) => {
                    self.limiter.until_ready().await;
                    self.handle(delivery).await;
                    processed += 1;
                    if processed % HEARTBEAT_EVERY == 0 {
                        self.heartbeat().await;
                    }
                }
                Ok(None) => self.heartbeat().await,
                Err(e) => {
                    error!(queue = %self.queue, consumer = %self.consumer, error = %e, "Worker failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        lease.cancel();
        if let Err(e) = keeper.await {
            error!(consumer = %self.consumer, error = %e, "Lease keeper panicked");
        }
        info!(queue = %self.queue, consumer = %self.consumer, processed, "Worker stopped");
    }

    async fn keep_alive(&self) {
        if let Err(e) = self.broker.keep_alive(self.queue, &self.consumer, LEASE_TTL).await {
            warn!(consumer = %self.consumer, error = %e, "Failed to refresh consumer lease");
        }
    }

    /// Refreshes the lease on its own task, so a long conversion does not
    /// let it lapse.
    fn spawn_lease_keeper(&self, stop: CancellationToken) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let (queue, consumer) = (self.queue, self.consumer.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEASE_REFRESH);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = broker.keep_alive(queue, &consumer, LEASE_TTL).await {
                            warn!(consumer = %consumer, error = %e, "Failed to refresh consumer lease");
                        }
                    }
                }
            }
        })
    }

    async fn reap(&self) {
        match self.broker.reap_orphans(self.queue).await {
            Ok(0) => {}
            Ok(reaped) => warn!(queue = %self.queue, reaped, "Re-queued jobs held by expired consumers"),
            Err(e) => warn!(queue = %self.queue, error = %e, "Failed to reap orphaned jobs"),
        }
    }

    async fn heartbeat(&self) {
        if let Ok(queue_length) = self.broker.queue_length(self.queue).await {
            telemetry::record_worker_heartbeat(self.queue, queue_length);
        }
    }

    /// Promotes due retries, then claims the next job.
    async fn claim_next(&self, wait: Duration) -> Result<Option<Delivery>> {
        if let Err(e) = self.broker.promote_due().await {
            warn!(error = %e, "Failed to promote scheduled jobs");
        }
        self.broker.claim(self.queue, &self.consumer, wait).await
    }

    /// Claims and processes at most one job. Returns whether a job was claimed.
    ///
    /// Refreshes this consumer's lease and reaps orphaned work first.
    pub async fn run_once(&self, wait: Duration) -> Result<bool> {
        self.keep_alive().await;
        self.reap().await;
        let Some(delivery) = self.claim_next(wait).await? else {
            return Ok(false);
        };

        self.limiter.until_ready().await;
        self.handle(delivery).await;
        Ok(true)
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            error!(job_id = %delivery.job_id, error = %e, "Failed to acknowledge job");
        }
    }

    async fn save(&self, job: &Job) {
        if let Err(e) = self.jobs.save(job).await {
            error!(job_id = %job.id, status = %job.status, error = %e, "Failed to update job status");
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let mut job = match self.jobs.load(&delivery.job_id).await {
            Ok(Some(job)) => {
                self.load_failures().remove(&delivery.job_id);
                job
            }
            Ok(None) => {
                warn!(job_id = %delivery.job_id, "Job record missing or expired, dropping delivery");
                self.ack(&delivery).await;
                return;
            }
            Err(e) if e.downcast_ref::<UnreadableRecord>().is_some() => {
                error!(job_id = %delivery.job_id, error = %e, "Job record cannot be decoded, dropping delivery");
                self.ack(&delivery).await;
                return;
            }
            Err(e) => {
                self.redeliver_unloaded(&delivery, e).await;
                return;
            }
        };

        if job.status.is_terminal() {
            info!(job_id = %job.id, status = %job.status, "Dropping duplicate delivery of finished job");
            self.ack(&delivery).await;
            return;
        }

        if job.status.is_active() {
            // A previous attempt was claimed but never finished.
            warn!(job_id = %job.id, status = %job.status, "Job was abandoned mid-attempt");
            match job.retry(self.ctx.limits.max_retries, "worker lost during execution") {
                Ok(true) => {}
                Ok(false) => {
                    self.finish(&delivery, &job).await;
                    return;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Cannot reset abandoned job");
                    self.ack(&delivery).await;
                    return;
                }
            }
        }

        info!(
            job_id = %job.id,
            pair = %job.pair(),
            queue = %job.queue,
            attempt = job.retry_count + 1,
            "Processing job"
        );

        match self.execute(&mut job).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    output = ?job.output_path,
                    duration_ms = ?job.processing_duration_ms(),
                    "Job completed"
                );
                self.finish(&delivery, &job).await;
            }
            Err(err) => self.fail(&delivery, &mut job, err).await,
        }
    }

    fn load_failures(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.load_failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reschedules a delivery whose record could not be read, up to
    /// [`MAX_LOAD_ATTEMPTS`] times.
    async fn redeliver_unloaded(&self, delivery: &Delivery, err: anyhow::Error) {
        let attempts = {
            let mut failures = self.load_failures();
            let attempts = failures.entry(delivery.job_id.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempts >= MAX_LOAD_ATTEMPTS {
            error!(job_id = %delivery.job_id, attempts, error = %err, "Giving up on job whose record cannot be loaded");
            self.load_failures().remove(&delivery.job_id);
            self.ack(delivery).await;
            return;
        }

        error!(job_id = %delivery.job_id, attempts, error = %err, "Failed to load job, rescheduling delivery");
        match self
            .broker
            .schedule(delivery.queue, &delivery.job_id, self.ctx.limits.retry_delay)
            .await
        {
            Ok(()) => self.ack(delivery).await,
            Err(e) => error!(job_id = %delivery.job_id, error = %e, "Failed to reschedule delivery"),
        }
    }

    /// Applies the retry policy to a failed attempt.
    async fn fail(&self, delivery: &Delivery, job: &mut Job, err: ExecutionError) {
        let message = err.to_string();
        error!(job_id = %job.id, error = %message, retryable = err.is_retryable(), "Job failed");

        if !err.is_retryable() {
            if let Err(e) = job.mark_failed(message) {
                error!(job_id = %job.id, error = %e, "Cannot mark job failed");
            }
            self.finish(delivery, job).await;
            return;
        }

        match job.retry(self.ctx.limits.max_retries, message) {
            Ok(true) => {
                if let Err(e) = self.jobs.save(job).await {
                    // Left unacknowledged; recovery re-delivers it.
                    error!(job_id = %job.id, error = %e, "Failed to record retry");
                    return;
                }
                match self
                    .broker
                    .schedule(job.queue, &job.id, self.ctx.limits.retry_delay)
                    .await
                {
                    Ok(()) => {
                        info!(
                            job_id = %job.id,
                            retry_count = job.retry_count,
                            delay_secs = self.ctx.limits.retry_delay.as_secs(),
                            "Job re-queued for retry"
                        );
                        telemetry::record_job_telemetry(job, self.ctx.limits.soft_time_limit);
                        self.ack(delivery).await;
                    }
                    Err(e) => error!(job_id = %job.id, error = %e, "Failed to schedule retry"),
                }
            }
            Ok(false) => {
                warn!(job_id = %job.id, retry_count = job.retry_count, "Job failed permanently, max retries exceeded");
                self.finish(delivery, job).await;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Cannot retry job");
                self.ack(delivery).await;
            }
        }
    }

    /// Persists a terminal job and acknowledges its delivery. If the record
    /// cannot be written the delivery stays in flight for recovery.
    async fn finish(&self, delivery: &Delivery, job: &Job) {
        debug_assert!(job.status.is_terminal());
        if self.ctx.storage.kind().is_remote() {
            self.discard_scratch(job).await;
        }

        if let Err(e) = self.jobs.save(job).await {
            error!(job_id = %job.id, status = %job.status, error = %e, "Failed to record final job status");
            return;
        }
        telemetry::record_job_telemetry(job, self.ctx.limits.soft_time_limit);
        self.ack(delivery).await;
    }

    /// Removes the job's local copies once the remote backend holds the
    /// artifact (or the job is beyond saving).
    async fn discard_scratch(&self, job: &Job) {
        let mut scratch = vec![self.ctx.resolver.local_path(&job.input_path)];
        if job.status == JobStatus::Completed {
            if let Some(output) = &job.output_path {
                scratch.push(self.ctx.resolver.local_path(output));
            }
        }
        for path in scratch {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
            }
        }
    }

    /// One attempt: PENDING -> STARTED -> PROGRESS(25) -> CONVERTING(50)
    /// -> PROGRESS(90) -> COMPLETED.
    async fn execute(&self, job: &mut Job) -> Result<(), ExecutionError> {
        job.start()?;
        self.save(job).await;

        let converter = self.ctx.registry.resolve(job.pair())?;
        job.report_progress(25, "Initializing converter...")?;
        self.save(job).await;

        let input = self.ctx.resolver.local_path(&job.input_path);
        let storage = &self.ctx.storage;
        if storage.kind().is_remote() && !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            let message = storage.download(&job.input_path, &input).await?;
            debug!(job_id = %job.id, message = %message, "Fetched input into scratch area");
        }
        let output = self.ctx.resolver.output_path(&job.id, job.to_format);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ConvertError::from)?;
        }

        job.mark_converting(
            50,
            format!("Converting {} to {}...", job.from_format, job.to_format),
        )?;
        self.save(job).await;

        let report = self.convert_with_limits(converter, input, output).await?;
        debug!(job_id = %job.id, message = %report.message, "Converter finished");

        let resolver = self.ctx.resolver.clone();
        let (job_id, target) = (job.id.clone(), job.to_format);
        let artifact = tokio::task::spawn_blocking(move || resolver.resolve(&job_id, target, report.produced))
            .await
            .map_err(|e| ExecutionError::Aborted(e.to_string()))??;

        job.report_progress(90, "Uploading to storage...")?;
        self.save(job).await;

        let uploaded = storage.upload(&artifact.path, &artifact.key).await?;
        debug!(job_id = %job.id, message = %uploaded.message, "Artifact stored");

        job.mark_complete(artifact.key, uploaded.public_url)?;
        Ok(())
    }

    /// Runs the blocking converter on the blocking pool.
    ///
    /// At the soft limit the cancellation token fires; a converter that winds
    /// down reports `Cancelled`, which is fatal. At the hard limit the worker
    /// stops waiting and the attempt fails regardless.
    async fn convert_with_limits(
        &self,
        converter: Arc<dyn Converter>,
        input: PathBuf,
        output: PathBuf,
    ) -> Result<ConversionReport, ExecutionError> {
        let TaskLimits {
            soft_time_limit,
            hard_time_limit,
            ..
        } = self.ctx.limits;

        let cancel = CancellationToken::new();
        let soft_timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(soft_time_limit).await;
                cancel.cancel();
            })
        };

        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || converter.convert(&input, &output, &token));
        let outcome = tokio::time::timeout(hard_time_limit, task).await;
        soft_timer.abort();

        match outcome {
            Err(_) => {
                cancel.cancel();
                Err(ExecutionError::HardTimeLimitExceeded(hard_time_limit))
            }
            Ok(Err(join)) => Err(ExecutionError::Aborted(join.to_string())),
            Ok(Ok(Err(ConvertError::Cancelled))) => Err(ExecutionError::SoftTimeLimitExceeded(soft_time_limit)),
            Ok(Ok(result)) => result.map_err(ExecutionError::from),
        }
    }
}

/// Spawns `concurrency` loops for every configured queue.
///
/// `connect` is called once per loop, since a broker claim may hold its
/// connection while it waits.
pub async fn spawn_pool<F, Fut>(
    ctx: Arc<WorkerContext>,
    config: &WorkerConfig,
    mut connect: F,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<()>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(Arc<dyn Broker>, Arc<dyn JobStore>)>>,
{
    let mut handles = Vec::new();
    for &queue in &config.queues {
        let limiter = queue_limiter(config.rate_limit_per_minute);
        for n in 0..config.concurrency {
            let (broker, jobs) = connect().await?;
            let worker = Worker::new(
                ctx.clone(),
                broker,
                jobs,
                queue,
                format!("{}-{}-{}", config.worker_id, queue, n),
                limiter.clone(),
            );
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }
    }

    info!(
        queues = ?config.queues,
        concurrency = config.concurrency,
        rate_limit_per_minute = config.rate_limit_per_minute,
        "Worker pool started"
    );
    Ok(handles)
}
