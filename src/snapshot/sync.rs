use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::budget::WriteBudget;
use super::fault::FaultInjector;

/// What a sync pass needs from its target
#[derive(Debug, Clone)]
pub(crate) struct SyncSource {
    pub(crate) path: PathBuf,
    pub(crate) file: Arc<File>,
    /// Bytes appended since the last sync
    pub(crate) pending: Arc<AtomicU64>,
    pub(crate) budget: Arc<WriteBudget>,
    pub(crate) faults: Arc<dyn FaultInjector>,
}

impl SyncSource {
    /// Force pending bytes to disk and hand their budget back
    ///
    /// Keeps going while writes land during the force, so a burst cannot hold
    /// budget until the next tick. Budget is returned even when the force
    /// fails. Returns the number of bytes synced.
    pub(crate) async fn sync_pending(&self) -> u64 {
        let mut total = 0;
        loop {
            let pending = self.pending.swap(0, Ordering::SeqCst);
            if pending == 0 {
                break;
            }

            let file = Arc::clone(&self.file);
            let faults = Arc::clone(&self.faults);
            let forced = tokio::task::spawn_blocking(move || {
                faults.before_sync()?;
                file.sync_data()
            });
            match forced.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Error syncing snapshot {}: {}", self.path.display(), e);
                }
                Err(e) => {
                    tracing::error!("Sync task for snapshot {} failed: {}", self.path.display(), e);
                }
            }

            self.budget.release(pending);
            total += pending;
        }
        total
    }
}

/// Fixed-rate background sync for one target
pub(crate) struct SyncWorker {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    /// Start syncing `source` every `interval`, first tick one interval from now
    pub(crate) fn start(runtime: &Handle, source: SyncSource, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = runtime.spawn(async move {
            tracing::debug!(
                "Sync worker for {} started with interval {:?}",
                source.path.display(),
                interval
            );

            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let synced = source.sync_pending().await;
                        if synced > 0 {
                            tracing::debug!("Synced {} bytes of {}", synced, source.path.display());
                        }
                    }
                }
            }

            tracing::debug!("Sync worker for {} stopped", source.path.display());
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the worker, letting a sync already in progress finish first
    pub(crate) async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Sync worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
