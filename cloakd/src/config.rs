//! JSON configuration document: load + startup validation.
//! One file describes process matchers, intervals, thermal/power ceilings,
//! and the per-resource allocation envelopes.

use crate::error::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProcessMatchers {
    /// Case-insensitive substring matched against CPU-worker process names.
    #[serde(rename = "CPU", default)]
    pub cpu: String,
    /// Same for GPU workers. Matching also marks a process GPU-eligible.
    #[serde(rename = "GPU", default)]
    pub gpu: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringParameters {
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,
    #[serde(default = "default_probe_interval")]
    pub temperature_monitoring_interval_seconds: u64,
    #[serde(default = "default_probe_interval")]
    pub power_monitoring_interval_seconds: u64,
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval_seconds: u64,
    #[serde(default = "default_azure_interval")]
    pub azure_monitor_interval_seconds: u64,
}

fn default_monitor_interval() -> u64 {
    10
}
fn default_probe_interval() -> u64 {
    60
}
fn default_optimization_interval() -> u64 {
    30
}
fn default_azure_interval() -> u64 {
    300
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: default_monitor_interval(),
            temperature_monitoring_interval_seconds: default_probe_interval(),
            power_monitoring_interval_seconds: default_probe_interval(),
            optimization_interval_seconds: default_optimization_interval(),
            azure_monitor_interval_seconds: default_azure_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemperatureLimits {
    #[serde(default = "default_cpu_temp")]
    pub cpu_max_celsius: f32,
    #[serde(default = "default_gpu_temp")]
    pub gpu_max_celsius: f32,
}

fn default_cpu_temp() -> f32 {
    75.0
}
fn default_gpu_temp() -> f32 {
    85.0
}

impl Default for TemperatureLimits {
    fn default() -> Self {
        Self {
            cpu_max_celsius: default_cpu_temp(),
            gpu_max_celsius: default_gpu_temp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PowerLimits {
    #[serde(default)]
    pub per_device_power_watts: DevicePowerWatts,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicePowerWatts {
    #[serde(default = "default_cpu_watts")]
    pub cpu: f64,
    #[serde(default = "default_gpu_watts")]
    pub gpu: f64,
}

fn default_cpu_watts() -> f64 {
    120.0
}
fn default_gpu_watts() -> f64 {
    250.0
}

impl Default for DevicePowerWatts {
    fn default() -> Self {
        Self {
            cpu: default_cpu_watts(),
            gpu: default_gpu_watts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResourceAllocation {
    #[serde(default)]
    pub ram: RamAllocation,
    #[serde(default)]
    pub gpu: GpuAllocation,
    #[serde(default)]
    pub disk_io: DiskIoAllocation,
    #[serde(default)]
    pub network: NetworkAllocation,
    #[serde(default)]
    pub cache: CacheAllocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RamAllocation {
    #[serde(default = "default_ram_mb")]
    pub max_allocation_mb: u64,
}

fn default_ram_mb() -> u64 {
    8192
}

impl Default for RamAllocation {
    fn default() -> Self {
        Self {
            max_allocation_mb: default_ram_mb(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpuAllocation {
    #[serde(default = "default_gpu_usage")]
    pub max_usage_percent: Vec<f64>,
}

fn default_gpu_usage() -> Vec<f64> {
    vec![80.0]
}

impl Default for GpuAllocation {
    fn default() -> Self {
        Self {
            max_usage_percent: default_gpu_usage(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskIoAllocation {
    #[serde(default = "default_disk_min")]
    pub min_limit_mbps: f64,
    #[serde(default = "default_disk_max")]
    pub max_limit_mbps: f64,
}

fn default_disk_min() -> f64 {
    10.0
}
fn default_disk_max() -> f64 {
    100.0
}

impl Default for DiskIoAllocation {
    fn default() -> Self {
        Self {
            min_limit_mbps: default_disk_min(),
            max_limit_mbps: default_disk_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAllocation {
    #[serde(default = "default_bandwidth")]
    pub bandwidth_limit_mbps: f64,
}

fn default_bandwidth() -> f64 {
    100.0
}

impl Default for NetworkAllocation {
    fn default() -> Self {
        Self {
            bandwidth_limit_mbps: default_bandwidth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheAllocation {
    #[serde(default = "default_cache_pct")]
    pub limit_percent: f64,
}

fn default_cache_pct() -> f64 {
    50.0
}

impl Default for CacheAllocation {
    fn default() -> Self {
        Self {
            limit_percent: default_cache_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizationParameters {
    #[serde(default = "default_gpu_step")]
    pub gpu_power_adjustment_step: f64,
    #[serde(default = "default_disk_step")]
    pub disk_io_limit_step_mbps: f64,
}

fn default_gpu_step() -> f64 {
    10.0
}
fn default_disk_step() -> f64 {
    5.0
}

impl Default for OptimizationParameters {
    fn default() -> Self {
        Self {
            gpu_power_adjustment_step: default_gpu_step(),
            disk_io_limit_step_mbps: default_disk_step(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub processes: ProcessMatchers,
    #[serde(default)]
    pub process_priority_map: HashMap<String, i32>,
    #[serde(default)]
    pub monitoring_parameters: MonitoringParameters,
    #[serde(default)]
    pub temperature_limits: TemperatureLimits,
    #[serde(default)]
    pub power_limits: PowerLimits,
    #[serde(default)]
    pub resource_allocation: ResourceAllocation,
    #[serde(default)]
    pub optimization_parameters: OptimizationParameters,
    #[serde(default = "default_interface")]
    pub network_interface: String,
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
}

fn default_interface() -> String {
    "eth0".into()
}

fn default_model_path() -> PathBuf {
    PathBuf::from("model.json")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Static priority for a process name, defaulting to 1 (lowest).
    pub fn priority_for(&self, name: &str) -> i32 {
        let lower = name.to_lowercase();
        self.process_priority_map
            .iter()
            .find(|(k, _)| lower.contains(&k.to_lowercase()))
            .map(|(_, v)| *v)
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.processes.cpu.is_empty() && self.processes.gpu.is_empty() {
            return Err(Error::ConfigInvalid(
                "processes: at least one of CPU/GPU matcher must be set".into(),
            ));
        }
        let m = &self.monitoring_parameters;
        for (label, v) in [
            ("monitor_interval_seconds", m.monitor_interval_seconds),
            (
                "temperature_monitoring_interval_seconds",
                m.temperature_monitoring_interval_seconds,
            ),
            (
                "power_monitoring_interval_seconds",
                m.power_monitoring_interval_seconds,
            ),
            (
                "optimization_interval_seconds",
                m.optimization_interval_seconds,
            ),
            (
                "azure_monitor_interval_seconds",
                m.azure_monitor_interval_seconds,
            ),
        ] {
            if v == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "monitoring_parameters.{label} must be > 0"
                )));
            }
        }
        if self.temperature_limits.cpu_max_celsius <= 0.0
            || self.temperature_limits.gpu_max_celsius <= 0.0
        {
            return Err(Error::ConfigInvalid(
                "temperature_limits must be positive".into(),
            ));
        }
        let watts = &self.power_limits.per_device_power_watts;
        if watts.cpu <= 0.0 || watts.gpu <= 0.0 {
            return Err(Error::ConfigInvalid(
                "power_limits.per_device_power_watts must be positive".into(),
            ));
        }
        let alloc = &self.resource_allocation;
        if alloc.ram.max_allocation_mb == 0 {
            return Err(Error::ConfigInvalid(
                "resource_allocation.ram.max_allocation_mb must be > 0".into(),
            ));
        }
        if alloc.gpu.max_usage_percent.is_empty()
            || alloc
                .gpu
                .max_usage_percent
                .iter()
                .any(|p| !(0.0..=100.0).contains(p))
        {
            return Err(Error::ConfigInvalid(
                "resource_allocation.gpu.max_usage_percent entries must be within 0..=100".into(),
            ));
        }
        if alloc.disk_io.min_limit_mbps <= 0.0
            || alloc.disk_io.max_limit_mbps < alloc.disk_io.min_limit_mbps
        {
            return Err(Error::ConfigInvalid(
                "resource_allocation.disk_io limits must satisfy 0 < min <= max".into(),
            ));
        }
        if alloc.network.bandwidth_limit_mbps <= 0.0 {
            return Err(Error::ConfigInvalid(
                "resource_allocation.network.bandwidth_limit_mbps must be > 0".into(),
            ));
        }
        if !(0.0..=100.0).contains(&alloc.cache.limit_percent) {
            return Err(Error::ConfigInvalid(
                "resource_allocation.cache.limit_percent must be within 0..=100".into(),
            ));
        }
        let opt = &self.optimization_parameters;
        if opt.gpu_power_adjustment_step <= 0.0 || opt.disk_io_limit_step_mbps <= 0.0 {
            return Err(Error::ConfigInvalid(
                "optimization_parameters steps must be positive".into(),
            ));
        }
        if self.network_interface.is_empty() {
            return Err(Error::ConfigInvalid("network_interface must be set".into()));
        }
        Ok(())
    }
}
