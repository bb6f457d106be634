//! Periodic driver for the expiration sweeper.
//!
//! The table itself only exposes `sweep_next_batch`; this runner calls it
//! on an interval from a background task until shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::table::Table;

#[derive(Debug, Clone)]
pub struct SweepRunnerConfig {
    /// Delay between sweep batches.
    pub interval: Duration,
    /// Events older than this horizon are expired.
    pub horizon: time::Duration,
}

pub struct SweepRunner {
    table: Arc<Table>,
    config: SweepRunnerConfig,
}

impl SweepRunner {
    pub fn new(table: Arc<Table>, config: SweepRunnerConfig) -> Self {
        Self { table, config }
    }

    /// Run until the shutdown channel flips to `true` or closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            table = %self.table.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            "sweep runner started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let table = self.table.clone();
                    let horizon = self.config.horizon;
                    match tokio::task::spawn_blocking(move || table.sweep_next_batch(horizon)).await {
                        Ok(Ok(stats)) => {
                            if stats.deleted_events > 0 || stats.deleted_objects > 0 {
                                debug!(
                                    deleted_events = stats.deleted_events,
                                    deleted_objects = stats.deleted_objects,
                                    "sweep batch"
                                );
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "sweep batch failed"),
                        Err(e) => warn!(error = %e, "sweep task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(table = %self.table.name(), "sweep runner stopping");
                        break;
                    }
                }
            }
        }
    }
}
