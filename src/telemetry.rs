//! Telemetry and structured logging for conversion workers.

use crate::job::{Job, JobStatus};
use crate::queue::QueueName;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use std::time::Duration;
use tracing::{info, warn};

const TRACER_NAME: &str = "convert-worker";

/// Records telemetry for a finished job attempt.
///
/// Emits one OpenTelemetry span and one structured log line per attempt:
/// - Job id, conversion pair and queue
/// - Status and retry count
/// - Duration since submission (ms), for terminal jobs
/// - Error message, for failed or retried attempts
///
/// Terminal jobs that took longer than `slow_threshold` are logged at `warn`.
pub fn record_job_telemetry(job: &Job, slow_threshold: Duration) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");

    span.set_attribute(KeyValue::new("job_id", job.id.clone()));
    span.set_attribute(KeyValue::new("pair", job.pair().to_string()));
    span.set_attribute(KeyValue::new("queue", job.queue.as_str()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("retry_count", job.retry_count as i64));

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.id,
            pair = %job.pair(),
            queue = %job.queue,
            duration_ms = duration_ms,
            status = %job.status,
            "Conversion job finished"
        );

        if duration_ms > slow_threshold.as_millis() as i64 {
            warn!(
                job_id = %job.id,
                duration_ms = duration_ms,
                threshold_ms = slow_threshold.as_millis() as u64,
                "Conversion exceeded soft time limit threshold"
            );
        }
    }

    if let Some(ref error) = job.error {
        span.set_attribute(KeyValue::new("error", error.clone()));
        if job.status == JobStatus::Failed {
            warn!(
                job_id = %job.id,
                error = %error,
                retry_count = job.retry_count,
                "Conversion job failed"
            );
        } else {
            info!(
                job_id = %job.id,
                error = %error,
                retry_count = job.retry_count,
                "Conversion attempt failed, retry scheduled"
            );
        }
    }

    span.end();
}

/// Records a worker heartbeat for monitoring worker health.
///
/// Called by every worker loop when its queue is idle and periodically
/// while it is busy.
pub fn record_worker_heartbeat(queue: QueueName, queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue", queue.as_str()));
    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue = %queue, queue_length = queue_length, "Worker heartbeat");
}

/// Initializes OpenTelemetry with OTLP exporter.
///
/// This should be called once at startup. Reads configuration from
/// environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: convert-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| TRACER_NAME.to_string());

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?
        .provider()
        .ok_or("OTLP pipeline returned a tracer without a provider")?;

    global::set_tracer_provider(provider);

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

/// Flushes pending spans on shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
