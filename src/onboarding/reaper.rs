//! Abandonment reaper — removes registrations that never finished.
//!
//! A sweep selects incomplete registrations older than the retention window
//! and deletes each one in its own transaction, so an interrupted sweep
//! leaves every account either fully present or fully gone.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::DatabaseError;
use crate::store::AccountStore;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Registrations selected as abandoned.
    pub candidates: usize,
    /// Registrations deleted.
    pub removed: usize,
    /// Deletions that failed and were left for the next sweep.
    pub failed: usize,
}

pub struct Reaper {
    store: Arc<dyn AccountStore>,
    retention: chrono::Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn AccountStore>, retention: chrono::Duration) -> Self {
        Self { store, retention }
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> Result<ReapReport, DatabaseError> {
        let cutoff = Utc::now() - self.retention;
        let candidates = self.store.find_abandoned(cutoff).await?;
        let mut report = ReapReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for id in candidates {
            match self.store.delete_abandoned(id).await {
                Ok(true) => {
                    report.removed += 1;
                    info!(account_id = %id, "Reaped abandoned registration");
                }
                // Progressed or deleted since selection
                Ok(false) => debug!(account_id = %id, "Skipped registration, no longer abandoned"),
                Err(e) => {
                    report.failed += 1;
                    error!(account_id = %id, error = %e, "Failed to reap registration");
                }
            }
        }

        info!(
            removed = report.removed,
            failed = report.failed,
            cutoff = %cutoff,
            "Reaper sweep complete"
        );
        Ok(report)
    }
}

/// Spawn the reaper background task, sweeping at every fire time of
/// `schedule`.
pub fn spawn_reaper_task(
    reaper: Arc<Reaper>,
    schedule: cron::Schedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Reaper schedule has no upcoming fire time, stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = reaper.sweep().await {
                error!(error = %e, "Reaper sweep failed");
            }
        }
    })
}
