//! Periodic auto-sync loop.
//!
//! Reads settings on every tick so an operator can flip `auto_sync_enabled`
//! or change the interval without a restart. Each tick enqueues one batch
//! job covering the whole catalog; overlap protection comes from the
//! per-resource leases the batch handler takes, not from this loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stockbridge_core::SettingsProvider;
use stockbridge_queue::{EnqueueOptions, JobPayload, SyncOptions};

use crate::client::ResourceCatalog;
use crate::service::SyncService;

/// How long to wait before re-reading settings while auto sync is disabled
/// or the settings provider is failing.
const RECHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct AutoSync {
    service: Arc<SyncService>,
    settings: Arc<dyn SettingsProvider>,
    catalog: Arc<dyn ResourceCatalog>,
    shutdown: Arc<Notify>,
}

impl AutoSync {
    pub fn new(
        service: Arc<SyncService>,
        settings: Arc<dyn SettingsProvider>,
        catalog: Arc<dyn ResourceCatalog>,
    ) -> Self {
        Self {
            service,
            settings,
            catalog,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn the loop. The returned handle finishes after [`Self::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let settings = self.settings.clone();
        let catalog = self.catalog.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("auto-sync loop started");
            loop {
                let wait = match settings.settings() {
                    Ok(s) if s.auto_sync_enabled => {
                        Duration::from_secs(s.interval_minutes as u64 * 60)
                    }
                    Ok(_) => {
                        debug!("auto sync disabled, rechecking later");
                        RECHECK_INTERVAL
                    }
                    Err(e) => {
                        warn!(error = %e, "could not read sync settings");
                        RECHECK_INTERVAL
                    }
                };

                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                // Settings may have been flipped while we slept.
                let enabled = settings.settings().map(|s| s.auto_sync_enabled).unwrap_or(false);
                if !enabled {
                    continue;
                }

                let resource_ids = catalog.resource_ids();
                if resource_ids.is_empty() {
                    debug!("catalog empty, nothing to sync");
                    continue;
                }
                let total = resource_ids.len();
                let payload = JobPayload::BatchSync {
                    resource_ids,
                    options: SyncOptions::default(),
                };
                match service.enqueue(payload, EnqueueOptions::default().with_created_by("auto-sync"))
                {
                    Ok(job_id) => info!(%job_id, resources = total, "auto-sync batch enqueued"),
                    Err(e) => warn!(error = %e, "failed to enqueue auto-sync batch"),
                }
            }
            info!("auto-sync loop stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
