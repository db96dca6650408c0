//! Periodic purge of unconfirmed instances

use crate::pool::Pool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs [`Pool::purge_instances`] on a fixed interval
#[derive(Debug, Clone)]
pub struct Reconciler {
    pool: Arc<Pool>,
    interval: Duration,
}

impl Reconciler {
    /// Create a reconciler; a zero interval disables it
    pub fn new(pool: Arc<Pool>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// Whether the sweep is enabled
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Start the sweep. Returns `None` when disabled.
    pub fn spawn(self, token: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            info!("Reconciliation disabled");
            return None;
        }

        info!(interval = ?self.interval, "Starting reconciliation loop");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Reconciliation loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let report = self.pool.purge_instances().await;
                        if report.removed_count() > 0 {
                            info!(
                                checked = report.checked,
                                removed = report.removed_count(),
                                "Reconciliation removed stale instances"
                            );
                        } else {
                            debug!(checked = report.checked, "Reconciliation found nothing stale");
                        }
                    }
                }
            }
        }))
    }
}
