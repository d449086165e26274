//! Cloaking strategies: pure policy objects that map a process's current
//! state to a set of knob targets. Mechanism lives in the adapters; a
//! strategy only describes the adjustment.

use crate::config::Config;
use crate::error::Error;
use crate::process::ManagedProcess;
use crate::queue::{Knob, KnobValue};
use std::collections::BTreeMap;

/// Knob -> target value. Ordered so application and logs are deterministic.
pub type AdjustmentsMap = BTreeMap<Knob, KnobValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Cpu,
    Gpu,
    Network,
    Cache,
    DiskIo,
}

impl StrategyKind {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "cpu" => Ok(StrategyKind::Cpu),
            "gpu" => Ok(StrategyKind::Gpu),
            "network" => Ok(StrategyKind::Network),
            "cache" => Ok(StrategyKind::Cache),
            "disk_io" => Ok(StrategyKind::DiskIo),
            other => Err(Error::StrategyUnknown(other.to_string())),
        }
    }
}

/// A constructed strategy with its config-driven parameters captured, so
/// `derive` needs nothing but the process.
#[derive(Debug, Clone)]
pub struct Strategy {
    kind: StrategyKind,
    gpu_available: bool,
    logical_cores: usize,
    gpu_power_watts: f64,
    gpu_power_step: f64,
    gpu_usage_targets: Vec<f64>,
    net_limit_mbps: f64,
    disk_min_mbps: f64,
    disk_max_mbps: f64,
    disk_step_mbps: f64,
}

impl Strategy {
    pub fn create(
        name: &str,
        cfg: &Config,
        gpu_available: bool,
        logical_cores: usize,
    ) -> Result<Self, Error> {
        let kind = StrategyKind::from_name(name)?;
        Ok(Self {
            kind,
            gpu_available,
            logical_cores: logical_cores.max(1),
            gpu_power_watts: cfg.power_limits.per_device_power_watts.gpu,
            gpu_power_step: cfg.optimization_parameters.gpu_power_adjustment_step,
            gpu_usage_targets: cfg.resource_allocation.gpu.max_usage_percent.clone(),
            net_limit_mbps: cfg.resource_allocation.network.bandwidth_limit_mbps,
            disk_min_mbps: cfg.resource_allocation.disk_io.min_limit_mbps,
            disk_max_mbps: cfg.resource_allocation.disk_io.max_limit_mbps,
            disk_step_mbps: cfg.optimization_parameters.disk_io_limit_step_mbps,
        })
    }

    /// Produce the adjustments for this process. An empty map is a no-op
    /// the caller logs.
    pub fn derive(&self, process: &ManagedProcess) -> AdjustmentsMap {
        let mut out = AdjustmentsMap::new();
        match self.kind {
            StrategyKind::Cpu => {
                out.insert(
                    Knob::CpuFreq,
                    KnobValue::Int(throttled_freq_mhz(process.cpu_usage)),
                );
                out.insert(
                    Knob::CpuThreads,
                    KnobValue::Int((self.logical_cores / 2).max(1) as i64),
                );
                out.insert(Knob::CpuNice, KnobValue::Int(19));
            }
            StrategyKind::Gpu => {
                if !self.gpu_available {
                    return out;
                }
                let cap = (self.gpu_power_watts - self.gpu_power_step).max(30.0);
                out.insert(Knob::GpuPowerLimit, KnobValue::Int(cap.round() as i64));
                out.insert(
                    Knob::GpuUsagePercent,
                    KnobValue::Percents(self.gpu_usage_targets.clone()),
                );
            }
            StrategyKind::Network => {
                out.insert(
                    Knob::NetworkBandwidthLimitMbps,
                    KnobValue::Float(self.net_limit_mbps),
                );
            }
            StrategyKind::Cache => {
                out.insert(Knob::DropCaches, KnobValue::Bool(true));
            }
            StrategyKind::DiskIo => {
                out.insert(Knob::IoniceClass, KnobValue::Int(3));
                let capped = (self.disk_max_mbps - self.disk_step_mbps)
                    .clamp(self.disk_min_mbps, self.disk_max_mbps);
                out.insert(Knob::DiskIoLimitMbps, KnobValue::Float(capped));
            }
        }
        out
    }
}

/// Frequency target by load: hotter workloads get pushed further down.
fn throttled_freq_mhz(load_percent: f32) -> i64 {
    if load_percent > 80.0 {
        2000
    } else if load_percent > 50.0 {
        2500
    } else {
        3000
    }
}
