//! Optimizer loop: per tick and per process, sample a feature vector,
//! run the action model, and enqueue the recommendation.

use crate::config::Config;
use crate::model::{ActionModel, FEATURE_LEN};
use crate::process::ManagedProcess;
use crate::queue::{AdjustmentTask, Submission, PRIORITY_ACTION};
use crate::registry::ProcessRegistry;
use crate::supervisor::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Optimizer {
    cfg: Arc<Config>,
    registry: Arc<ProcessRegistry>,
    model: Arc<ActionModel>,
    tx: mpsc::UnboundedSender<Submission>,
    stop: ShutdownSignal,
}

impl Optimizer {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<ProcessRegistry>,
        model: Arc<ActionModel>,
        tx: mpsc::UnboundedSender<Submission>,
        stop: ShutdownSignal,
    ) -> Self {
        Self {
            cfg,
            registry,
            model,
            tx,
            stop,
        }
    }

    pub async fn run(self) {
        let period =
            Duration::from_secs(self.cfg.monitoring_parameters.optimization_interval_seconds);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_s = period.as_secs(), "optimizer started");
        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                _ = ticker.tick() => {}
            }
            if self.stop.is_set() {
                break;
            }
            self.tick().await;
        }
        info!("optimizer stopped");
    }

    async fn tick(&self) {
        let total_memory_mb = self.registry.total_memory_mb().await;
        for process in self.registry.snapshots().await {
            let features = feature_vector(&process, &self.cfg, total_memory_mb);
            let action = self.model.infer(&features);
            debug!(
                pid = process.pid,
                ?features,
                ?action,
                "model recommendation"
            );
            let sub = Submission::new(
                PRIORITY_ACTION,
                AdjustmentTask::Optimization {
                    pid: process.pid,
                    action,
                },
            );
            if self.tx.send(sub).is_err() {
                warn!("executor is gone; dropping optimizer output");
                return;
            }
        }
    }
}

/// Model input: CPU %, RAM MB, GPU %, disk I/O Mbps, network Mbps, cache
/// limit %. Byte counters are deltas per monitor tick, converted to Mbps.
pub fn feature_vector(
    process: &ManagedProcess,
    cfg: &Config,
    total_memory_mb: f64,
) -> [f64; FEATURE_LEN] {
    let interval_s = cfg.monitoring_parameters.monitor_interval_seconds.max(1) as f64;
    [
        process.cpu_usage as f64,
        (process.memory_percent as f64 / 100.0) * total_memory_mb,
        process.gpu_usage as f64,
        process.disk_io_delta_mb / interval_s * 8.0,
        process.network_io_mb / interval_s * 8.0,
        cfg.resource_allocation.cache.limit_percent,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_follow_sampled_metrics() {
        let mut cfg = Config::default();
        cfg.monitoring_parameters.monitor_interval_seconds = 10;
        cfg.resource_allocation.cache.limit_percent = 40.0;

        let mut p = ManagedProcess::new(1001, "cpu_miner".into(), 2, "eth0".into(), false);
        p.cpu_usage = 75.0;
        p.memory_percent = 25.0;
        p.gpu_usage = 12.5;
        p.disk_io_delta_mb = 50.0;
        p.network_io_mb = 25.0;

        let f = feature_vector(&p, &cfg, 16_384.0);
        assert_eq!(f[0], 75.0);
        assert_eq!(f[1], 4096.0);
        assert_eq!(f[2], 12.5);
        assert_eq!(f[3], 40.0); // 50 MB / 10 s * 8
        assert_eq!(f[4], 20.0); // 25 MB / 10 s * 8
        assert_eq!(f[5], 40.0);
    }

    #[test]
    fn idle_process_yields_zeroed_features() {
        let cfg = Config::default();
        let p = ManagedProcess::new(1001, "cpu_miner".into(), 2, "eth0".into(), false);
        let f = feature_vector(&p, &cfg, 8_192.0);
        assert_eq!(&f[0..5], &[0.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
