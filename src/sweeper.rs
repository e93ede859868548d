//! Retention sweeper: reclaims uploads and artifacts past the retention window.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::storage::{LocalStorage, StorageBackend};

pub struct RetentionSweeper {
    storage: Arc<dyn StorageBackend>,
    /// Local scratch area, swept alongside a remote backend.
    scratch: Option<LocalStorage>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(storage: Arc<dyn StorageBackend>, retention: Duration) -> Self {
        Self {
            storage,
            scratch: None,
            retention,
        }
    }

    /// Also sweeps the local scratch area used in front of a remote backend.
    pub fn with_scratch(mut self, scratch: LocalStorage) -> Self {
        self.scratch = Some(scratch);
        self
    }

    /// Runs one sweep and returns the number of entries deleted.
    /// Failures are logged, never returned.
    pub async fn run_once(&self) -> usize {
        let mut deleted = match self.storage.cleanup_expired(self.retention).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!(backend = %self.storage.kind(), error = %e, "Retention sweep failed");
                0
            }
        };

        if let Some(scratch) = &self.scratch {
            let cutoff = SystemTime::now()
                .checked_sub(self.retention)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            deleted += scratch.cleanup_older_than(cutoff).await;
        }

        info!(
            deleted,
            backend = %self.storage.kind(),
            retention_hours = self.retention.as_secs() / 3600,
            "Retention sweep finished"
        );
        deleted
    }

    /// Sweeps on startup and then every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
        info!("Retention sweeper stopped");
    }
}
