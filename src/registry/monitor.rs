//! Heartbeat monitor for lease expiry
//!
//! ## Overview
//!
//! Backend instances renew their lease with periodic heartbeats. The monitor
//! sweeps the registry on a fixed interval and evicts every instance whose
//! last renewal is older than the lease duration.
//!
//! ## Self-preservation
//!
//! If a single sweep would evict more than the configured fraction of all
//! instances, the monitor assumes it is the one cut off from the network and
//! skips evictions for that cycle. Lapsed instances are still hidden from
//! routing by the registry's lazy expiry check.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::InstanceRegistry;

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between sweeps
    pub sweep_interval: Duration,
    /// Fraction of instances (0, 1] above which a sweep's evictions are skipped
    pub self_preservation_threshold: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            self_preservation_threshold: None,
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Records held when the sweep started
    pub scanned: usize,
    /// Records found past their deadline
    pub expired: usize,
    /// Records actually removed
    pub evicted: usize,
    /// Evictions skipped by self-preservation
    pub suspended: bool,
}

/// Background sweeper over the instance registry
pub struct HeartbeatMonitor {
    registry: Arc<InstanceRegistry>,
    config: MonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<InstanceRegistry>, config: MonitorConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run a single sweep at the current time
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let scanned = self.registry.instance_count();
        let expired = self.registry.expired_instances(now);

        let mut report = SweepReport {
            scanned,
            expired: expired.len(),
            ..SweepReport::default()
        };

        if expired.is_empty() {
            return report;
        }

        if let Some(threshold) = self.config.self_preservation_threshold {
            let fraction = expired.len() as f64 / scanned.max(1) as f64;
            if fraction > threshold {
                warn!(
                    expired = expired.len(),
                    scanned,
                    threshold,
                    "Self-preservation engaged, skipping evictions this cycle"
                );
                report.suspended = true;
                return report;
            }
        }

        report.evicted = self.registry.evict(&expired, now);
        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                remaining = self.registry.instance_count(),
                "Heartbeat sweep evicted stale instances"
            );
        }
        report
    }

    /// Spawn the sweep loop; it exits when `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            lease_ms = self.registry.lease_duration().as_millis() as u64,
            self_preservation = ?self.config.self_preservation_threshold,
            "Starting heartbeat monitor"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.sweep();
                        debug!(?report, "Heartbeat sweep complete");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Heartbeat monitor stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
