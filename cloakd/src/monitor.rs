//! Monitor loop: refreshes the registry, samples the thermal/power
//! envelope, divides cores by priority, and turns threshold breaches into
//! monitoring tasks (or restores once readings calm down).

use crate::config::Config;
use crate::gpu::GpuManager;
use crate::power::{CpuTempSensor, NodeEnvelope, RaplPowerSensor};
use crate::process::ManagedProcess;
use crate::queue::{
    AdjustmentTask, CloakFlags, Knob, KnobValue, Submission, PRIORITY_ACTION, PRIORITY_MONITOR,
    PRIORITY_RESTORE,
};
use crate::registry::ProcessRegistry;
use crate::supervisor::ShutdownSignal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Collaborator hook for the periodic external-telemetry pull. The real
/// cloud clients live outside the engine; the default sink just logs.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, envelope: &NodeEnvelope, processes: &[ManagedProcess]);
}

pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn publish(&self, envelope: &NodeEnvelope, processes: &[ManagedProcess]) {
        let payload = serde_json::json!({
            "envelope": envelope,
            "processes": processes,
        });
        debug!(%payload, "external telemetry pull");
    }
}

pub struct Monitor {
    cfg: Arc<Config>,
    registry: Arc<ProcessRegistry>,
    gpu: Arc<GpuManager>,
    envelope: Arc<RwLock<NodeEnvelope>>,
    temp_sensor: CpuTempSensor,
    power_sensor: RaplPowerSensor,
    tx: mpsc::UnboundedSender<Submission>,
    telemetry: Arc<dyn TelemetrySink>,
    stop: ShutdownSignal,
    last_alloc: HashMap<u32, i64>,
    last_temp_probe: Option<Instant>,
    last_power_probe: Option<Instant>,
    last_telemetry: Option<Instant>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<ProcessRegistry>,
        gpu: Arc<GpuManager>,
        envelope: Arc<RwLock<NodeEnvelope>>,
        tx: mpsc::UnboundedSender<Submission>,
        telemetry: Arc<dyn TelemetrySink>,
        stop: ShutdownSignal,
    ) -> Self {
        Self {
            cfg,
            registry,
            gpu,
            envelope,
            temp_sensor: CpuTempSensor::new(),
            power_sensor: RaplPowerSensor::new(),
            tx,
            telemetry,
            stop,
            last_alloc: HashMap::new(),
            last_temp_probe: None,
            last_power_probe: None,
            last_telemetry: None,
        }
    }

    pub async fn run(mut self) {
        let period = Duration::from_secs(self.cfg.monitoring_parameters.monitor_interval_seconds);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_s = period.as_secs(), "monitor started");
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
        info!("monitor stopped");
    }

    async fn tick(&mut self) {
        let outcome = self.registry.refresh(&self.cfg, &self.gpu).await;
        if !outcome.registered.is_empty() {
            debug!(new = outcome.registered.len(), "discovery registered processes");
        }
        for pid in &outcome.evicted {
            // Never enqueue restores for a pid that no longer exists; the
            // executor drops its saved limits on next touch.
            debug!(pid, "evicted during sample");
        }

        let env = self.refresh_envelope().await;
        let snapshots = self.registry.snapshots().await;

        let submissions = plan_adjustments(
            &env,
            &self.cfg,
            &snapshots,
            self.registry.logical_cores(),
            &mut self.last_alloc,
        );
        for sub in submissions {
            if self.tx.send(sub).is_err() {
                warn!("executor is gone; dropping monitor output");
                return;
            }
        }

        let azure_every =
            Duration::from_secs(self.cfg.monitoring_parameters.azure_monitor_interval_seconds);
        if due(self.last_telemetry, azure_every) {
            self.telemetry.publish(&env, &snapshots);
            self.last_telemetry = Some(Instant::now());
        }
    }

    /// Refresh the slow sensors on their own cadences; everything else on
    /// the envelope keeps its previous reading.
    async fn refresh_envelope(&mut self) -> NodeEnvelope {
        let mut env = *self.envelope.read().await;
        let temp_every = Duration::from_secs(
            self.cfg
                .monitoring_parameters
                .temperature_monitoring_interval_seconds,
        );
        let power_every =
            Duration::from_secs(self.cfg.monitoring_parameters.power_monitoring_interval_seconds);

        if due(self.last_temp_probe, temp_every) {
            env.cpu_temp_c = self.temp_sensor.probe();
            env.gpu_temp_c = self.gpu.max_temperature_c();
            self.last_temp_probe = Some(Instant::now());
        }
        if due(self.last_power_probe, power_every) {
            env.cpu_power_w = self.power_sensor.probe();
            env.gpu_power_w = self.gpu.total_power_w();
            self.last_power_probe = Some(Instant::now());
        }
        *self.envelope.write().await = env;
        env
    }
}

fn due(last: Option<Instant>, every: Duration) -> bool {
    last.is_none_or(|at| at.elapsed() >= every)
}

/// Cores a process asks for, derived from its measured load (percent of
/// one core, so 290% wants three).
pub fn requested_threads(process: &ManagedProcess, logical: usize) -> i64 {
    let want = (process.cpu_usage as f64 / 100.0).ceil() as i64;
    want.clamp(1, logical.max(1) as i64)
}

#[derive(Debug, PartialEq, Eq)]
pub struct CoreGrant {
    pub pid: u32,
    pub want: i64,
    pub grant: i64,
}

/// Divide the logical cores among processes by descending priority,
/// capping each at what remains.
pub fn allocate_cores(snapshots: &[ManagedProcess], logical: usize) -> Vec<CoreGrant> {
    let mut by_priority: Vec<&ManagedProcess> = snapshots.iter().collect();
    by_priority.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.pid.cmp(&b.pid)));

    let mut remaining = logical as i64;
    let mut grants = Vec::with_capacity(by_priority.len());
    for p in by_priority {
        let want = requested_threads(p, logical);
        let grant = want.min(remaining.max(0));
        remaining -= grant;
        grants.push(CoreGrant {
            pid: p.pid,
            want,
            grant,
        });
    }
    grants
}

/// Which cloak families this process needs, given the node envelope.
/// Zero readings mean an unavailable sensor and never trigger anything.
pub fn threshold_flags(env: &NodeEnvelope, cfg: &Config, process: &ManagedProcess) -> CloakFlags {
    let mut flags = CloakFlags::default();
    if NodeEnvelope::reading_valid(env.cpu_temp_c as f64)
        && env.cpu_temp_c > cfg.temperature_limits.cpu_max_celsius
    {
        flags.cpu = true;
    }
    if NodeEnvelope::reading_valid(env.cpu_power_w)
        && env.cpu_power_w > cfg.power_limits.per_device_power_watts.cpu
    {
        flags.cpu = true;
    }
    if process.gpu_eligible {
        if NodeEnvelope::reading_valid(env.gpu_temp_c as f64)
            && env.gpu_temp_c > cfg.temperature_limits.gpu_max_celsius
        {
            flags.gpu = true;
        }
        if NodeEnvelope::reading_valid(env.gpu_power_w)
            && env.gpu_power_w > cfg.power_limits.per_device_power_watts.gpu
        {
            flags.gpu = true;
        }
    }
    flags
}

/// True when every available reading sits at or below its ceiling. At
/// least one reading must be available; a blind node never restores.
pub fn within_safe_envelope(env: &NodeEnvelope, cfg: &Config) -> bool {
    let checks = [
        (
            env.cpu_temp_c as f64,
            cfg.temperature_limits.cpu_max_celsius as f64,
        ),
        (
            env.gpu_temp_c as f64,
            cfg.temperature_limits.gpu_max_celsius as f64,
        ),
        (env.cpu_power_w, cfg.power_limits.per_device_power_watts.cpu),
        (env.gpu_power_w, cfg.power_limits.per_device_power_watts.gpu),
    ];
    let mut any_valid = false;
    for (reading, limit) in checks {
        if NodeEnvelope::reading_valid(reading) {
            any_valid = true;
            if reading > limit {
                return false;
            }
        }
    }
    any_valid
}

/// One tick's worth of producer output: allocation adjustments first, then
/// at most one monitoring or restore task per process.
pub fn plan_adjustments(
    env: &NodeEnvelope,
    cfg: &Config,
    snapshots: &[ManagedProcess],
    logical: usize,
    last_alloc: &mut HashMap<u32, i64>,
) -> Vec<Submission> {
    let mut out = Vec::new();
    let by_pid: HashMap<u32, &ManagedProcess> =
        snapshots.iter().map(|p| (p.pid, p)).collect();

    for grant in allocate_cores(snapshots, logical) {
        if grant.grant < grant.want {
            warn!(
                pid = grant.pid,
                want = grant.want,
                granted = grant.grant,
                "no more cores to allocate"
            );
        }
        if grant.grant == 0 {
            continue;
        }
        if last_alloc.get(&grant.pid) == Some(&grant.grant) {
            continue;
        }
        last_alloc.insert(grant.pid, grant.grant);
        let name = by_pid
            .get(&grant.pid)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        out.push(Submission::new(
            PRIORITY_ACTION,
            AdjustmentTask::FunctionCall {
                pid: grant.pid,
                process_name: name,
                knob: Knob::CpuThreads,
                value: KnobValue::Int(grant.grant),
            },
        ));
    }
    last_alloc.retain(|pid, _| by_pid.contains_key(pid));

    for p in snapshots {
        let flags = threshold_flags(env, cfg, p);
        if flags.any() {
            out.push(Submission::new(
                PRIORITY_MONITOR,
                AdjustmentTask::Monitoring { pid: p.pid, flags },
            ));
        } else if p.is_cloaked && within_safe_envelope(env, cfg) {
            out.push(Submission::new(
                PRIORITY_RESTORE,
                AdjustmentTask::Restore { pid: p.pid },
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.temperature_limits.cpu_max_celsius = 75.0;
        cfg.temperature_limits.gpu_max_celsius = 80.0;
        cfg.power_limits.per_device_power_watts.cpu = 100.0;
        cfg.power_limits.per_device_power_watts.gpu = 250.0;
        cfg
    }

    fn proc_(pid: u32, priority: i32, cpu_usage: f32, gpu: bool) -> ManagedProcess {
        let mut p = ManagedProcess::new(
            pid,
            format!("{}_miner", if gpu { "gpu" } else { "cpu" }),
            priority,
            "eth0".into(),
            gpu,
        );
        p.cpu_usage = cpu_usage;
        p
    }

    #[test]
    fn hot_cpu_emits_one_monitoring_task_with_cpu_flag() {
        let env = NodeEnvelope {
            cpu_temp_c: 80.0,
            ..Default::default()
        };
        let procs = vec![proc_(1001, 2, 10.0, false)];
        let mut alloc = HashMap::new();
        let subs = plan_adjustments(&env, &cfg(), &procs, 4, &mut alloc);

        let monitoring: Vec<&Submission> = subs
            .iter()
            .filter(|s| matches!(s.task, AdjustmentTask::Monitoring { .. }))
            .collect();
        assert_eq!(monitoring.len(), 1);
        assert_eq!(monitoring[0].priority, PRIORITY_MONITOR);
        match &monitoring[0].task {
            AdjustmentTask::Monitoring { pid, flags } => {
                assert_eq!(*pid, 1001);
                assert!(flags.cpu);
                assert!(!flags.gpu);
            }
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn cooled_down_cloaked_process_gets_restore_at_top_priority() {
        let env = NodeEnvelope {
            cpu_temp_c: 60.0,
            ..Default::default()
        };
        let mut p = proc_(1001, 2, 10.0, false);
        p.is_cloaked = true;
        let mut alloc = HashMap::new();
        let subs = plan_adjustments(&env, &cfg(), &[p], 4, &mut alloc);
        let restore: Vec<&Submission> = subs
            .iter()
            .filter(|s| matches!(s.task, AdjustmentTask::Restore { .. }))
            .collect();
        assert_eq!(restore.len(), 1);
        assert_eq!(restore[0].priority, PRIORITY_RESTORE);
    }

    #[test]
    fn dead_sensors_neither_throttle_nor_restore() {
        let env = NodeEnvelope::default();
        let mut p = proc_(1001, 2, 10.0, false);
        p.is_cloaked = true;
        let mut alloc = HashMap::new();
        let subs = plan_adjustments(&env, &cfg(), &[p], 4, &mut alloc);
        assert!(subs
            .iter()
            .all(|s| matches!(s.task, AdjustmentTask::FunctionCall { .. })));
    }

    #[test]
    fn gpu_thresholds_only_flag_gpu_eligible_processes() {
        let env = NodeEnvelope {
            gpu_temp_c: 90.0,
            ..Default::default()
        };
        let procs = vec![proc_(1001, 2, 10.0, false), proc_(1002, 2, 10.0, true)];
        let mut alloc = HashMap::new();
        let subs = plan_adjustments(&env, &cfg(), &procs, 4, &mut alloc);
        let flagged: Vec<u32> = subs
            .iter()
            .filter_map(|s| match &s.task {
                AdjustmentTask::Monitoring { pid, flags } if flags.gpu => Some(*pid),
                _ => None,
            })
            .collect();
        assert_eq!(flagged, vec![1002]);
    }

    #[test]
    fn higher_priority_process_wins_the_cores() {
        // two processes wanting 3 cores each on a 4-core node
        let procs = vec![proc_(2001, 3, 280.0, false), proc_(2002, 2, 280.0, false)];
        let grants = allocate_cores(&procs, 4);
        assert_eq!(
            grants,
            vec![
                CoreGrant {
                    pid: 2001,
                    want: 3,
                    grant: 3
                },
                CoreGrant {
                    pid: 2002,
                    want: 3,
                    grant: 1
                },
            ]
        );
    }

    #[test]
    fn allocation_changes_become_thread_tasks_once() {
        let env = NodeEnvelope::default();
        let procs = vec![proc_(2001, 3, 280.0, false)];
        let mut alloc = HashMap::new();
        let first = plan_adjustments(&env, &cfg(), &procs, 4, &mut alloc);
        assert_eq!(first.len(), 1);
        match &first[0].task {
            AdjustmentTask::FunctionCall { knob, value, .. } => {
                assert_eq!(*knob, Knob::CpuThreads);
                assert_eq!(*value, KnobValue::Int(3));
            }
            other => panic!("unexpected task {other:?}"),
        }
        // unchanged load: nothing re-emitted
        let second = plan_adjustments(&env, &cfg(), &procs, 4, &mut alloc);
        assert!(second.is_empty());
    }

    #[test]
    fn requested_threads_follow_measured_load() {
        assert_eq!(requested_threads(&proc_(1, 1, 0.0, false), 8), 1);
        assert_eq!(requested_threads(&proc_(1, 1, 101.0, false), 8), 2);
        assert_eq!(requested_threads(&proc_(1, 1, 290.0, false), 8), 3);
        assert_eq!(requested_threads(&proc_(1, 1, 5000.0, false), 8), 8);
    }
}
