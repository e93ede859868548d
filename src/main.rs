//! Convert Worker Service
//!
//! Accepts conversion requests over HTTP, converts files on background
//! workers fed from Redis queues, and sweeps expired uploads and artifacts.
//!
//! ## Architecture
//!
//! - **Queues**: Redis lists (`convert:queue:{document,spreadsheet,image,default}`)
//! - **Retries**: Redis sorted set (`convert:delayed`)
//! - **Status**: Redis keys (`convert:job:{job_id}`)
//! - **Converters**: LibreOffice, poppler `pdftoppm`, and an in-process image to PDF pipeline
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Modes
//!
//! - `serve`: HTTP API plus the retention sweeper
//! - `worker`: queue consumers
//! - `sweep`: one retention sweep, then exit
//! - `standalone`: everything in one process over an in-memory broker
//!
//! ## Configuration
//!
//! Environment variables (see `config.rs` for the full list):
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `STORAGE_BACKEND`: `local`, `s3` or `supabase` (default: local)
//! - `WORKER_CONCURRENCY`: Consumers per queue (default: 2)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)
//! - `LOG_FORMAT`: `json` for JSON log lines

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convert_worker::artifact::{ArtifactResolver, OUTPUTS_DIR, UPLOADS_DIR};
use convert_worker::config::Config;
use convert_worker::queue::{Broker, JobStore, MemoryQueue, QueueName, RedisQueue};
use convert_worker::registry::Registry;
use convert_worker::service::ConversionService;
use convert_worker::storage::{build_backend, LocalStorage, StorageBackend};
use convert_worker::sweeper::RetentionSweeper;
use convert_worker::worker::{spawn_pool, WorkerContext};
use convert_worker::{api, telemetry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "convert-worker")]
#[command(author, version, about = "File conversion job pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the retention sweeper
    Serve {
        /// Address to listen on (overrides BIND_ADDR)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Consume conversion jobs from the queues
    Worker {
        /// Queues to consume, comma separated (overrides WORKER_QUEUES)
        #[arg(long, value_delimiter = ',')]
        queues: Vec<QueueName>,

        /// Consumers per queue (overrides WORKER_CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Run one retention sweep and exit
    Sweep,

    /// HTTP API, workers and sweeper in one process, without Redis
    Standalone {
        /// Address to listen on (overrides BIND_ADDR)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Invalid configuration")?;

    let result = match cli.command {
        Command::Serve { bind } => {
            config.bind_addr = bind.unwrap_or(config.bind_addr);
            serve(config).await
        }
        Command::Worker { queues, concurrency } => {
            if !queues.is_empty() {
                config.worker.queues = queues;
            }
            if let Some(concurrency) = concurrency {
                config.worker.concurrency = concurrency.max(1);
            }
            work(config).await
        }
        Command::Sweep => sweep(config).await,
        Command::Standalone { bind } => {
            config.bind_addr = bind.unwrap_or(config.bind_addr);
            standalone(config).await
        }
    };

    telemetry::shutdown_telemetry();
    result
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Shared pieces every mode builds the same way.
struct Runtime {
    config: Config,
    registry: Arc<Registry>,
    storage: Arc<dyn StorageBackend>,
    resolver: ArtifactResolver,
}

impl Runtime {
    async fn new(config: Config) -> Result<Self> {
        for dir in [UPLOADS_DIR, OUTPUTS_DIR] {
            let path = config.storage.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }

        let storage = build_backend(&config.storage).context("Failed to initialize storage backend")?;
        let registry = Arc::new(Registry::new(&config.tools));
        let resolver = ArtifactResolver::new(&config.storage.root);

        info!(
            storage_backend = %storage.kind(),
            storage_root = %config.storage.root.display(),
            retention_hours = config.retention.as_secs() / 3600,
            "Runtime initialized"
        );

        Ok(Self {
            config,
            registry,
            storage,
            resolver,
        })
    }

    fn service(&self, broker: Arc<dyn Broker>, jobs: Arc<dyn JobStore>) -> Arc<ConversionService> {
        Arc::new(ConversionService::new(
            self.registry.clone(),
            broker,
            jobs,
            self.storage.clone(),
            self.resolver.clone(),
            self.config.max_upload_bytes,
        ))
    }

    fn sweeper(&self) -> RetentionSweeper {
        let sweeper = RetentionSweeper::new(self.storage.clone(), self.config.retention);
        if self.storage.kind().is_remote() {
            sweeper.with_scratch(LocalStorage::new(&self.config.storage.root))
        } else {
            sweeper
        }
    }

    fn spawn_sweeper(&self, shutdown: &CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.sweeper().run(self.config.sweep_interval, shutdown.clone()))
    }

    fn worker_context(&self) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            storage: self.storage.clone(),
            limits: self.config.limits.clone(),
        })
    }
}

async fn connect_redis(config: &Config) -> Result<Arc<RedisQueue>> {
    let queue = RedisQueue::connect(&config.redis_url, config.result_ttl).await?;
    Ok(Arc::new(queue))
}

async fn serve(config: Config) -> Result<()> {
    let runtime = Runtime::new(config).await?;
    let queue = connect_redis(&runtime.config).await?;
    info!("Connected to Redis");

    let shutdown = shutdown_token();
    let sweeper = runtime.spawn_sweeper(&shutdown);

    let service = runtime.service(queue.clone(), queue);
    run_http(runtime.config.bind_addr, service, shutdown.clone()).await?;

    shutdown.cancel();
    join_all(vec![sweeper]).await;
    Ok(())
}

async fn work(config: Config) -> Result<()> {
    let runtime = Runtime::new(config).await?;
    let shutdown = shutdown_token();

    // BLMOVE holds its connection, so every consumer loop gets its own.
    let redis_url = runtime.config.redis_url.clone();
    let result_ttl = runtime.config.result_ttl;
    let handles = spawn_pool(
        runtime.worker_context(),
        &runtime.config.worker,
        || {
            let redis_url = redis_url.clone();
            async move {
                let queue = Arc::new(RedisQueue::connect(&redis_url, result_ttl).await?);
                Ok::<_, anyhow::Error>((queue.clone() as Arc<dyn Broker>, queue as Arc<dyn JobStore>))
            }
        },
        shutdown.clone(),
    )
    .await?;

    info!("Worker service ready, press Ctrl+C to shutdown");
    shutdown.cancelled().await;

    info!("Received shutdown signal, waiting for workers to finish...");
    join_all(handles).await;

    info!("Worker service shutdown complete");
    Ok(())
}

async fn sweep(config: Config) -> Result<()> {
    let runtime = Runtime::new(config).await?;
    let deleted = runtime.sweeper().run_once().await;
    info!(deleted, "Sweep complete");
    Ok(())
}

async fn standalone(config: Config) -> Result<()> {
    let runtime = Runtime::new(config).await?;
    let queue = Arc::new(MemoryQueue::new(runtime.config.result_ttl));
    let shutdown = shutdown_token();

    let mut handles = spawn_pool(
        runtime.worker_context(),
        &runtime.config.worker,
        || {
            let queue = queue.clone();
            async move { Ok::<_, anyhow::Error>((queue.clone() as Arc<dyn Broker>, queue as Arc<dyn JobStore>)) }
        },
        shutdown.clone(),
    )
    .await?;
    handles.push(runtime.spawn_sweeper(&shutdown));

    let service = runtime.service(queue.clone(), queue);
    run_http(runtime.config.bind_addr, service, shutdown.clone()).await?;

    shutdown.cancel();
    join_all(handles).await;
    Ok(())
}

async fn run_http(addr: SocketAddr, service: Arc<ConversionService>, shutdown: CancellationToken) -> Result<()> {
    let app = api::router(service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Starting server on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task panicked: {}", e);
        }
    }
}

/// Token cancelled on Ctrl+C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        trigger.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
