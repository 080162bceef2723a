//! Liveliness monitor
//!
//! Periodically sweeps the pool and terminates slots whose workers stopped
//! reporting, or that never saw a viewer.

use crate::spawner::SpawnPool;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct LivelinessMonitor {
    pool: Arc<SpawnPool>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl LivelinessMonitor {
    pub fn new(pool: Arc<SpawnPool>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let interval = pool.config().spawn.liveliness_interval();
        Self {
            pool,
            interval,
            shutdown_rx,
        }
    }

    /// Override the sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            timeout_secs = self.pool.config().spawn.liveliness_timeout().as_secs(),
            "Liveliness monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let evicted = self.pool.sweep(Utc::now());
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), "Sweep terminated slots");
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Liveliness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
