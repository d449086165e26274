//! NVML capability layer: device memory, temperature, power draw, and the
//! power-management limit used for both capping and usage targets.
//! Initialization is best-effort; without a driver every probe reports
//! unavailable and the GPU knobs stay disabled.

use crate::error::Error;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::sync::Mutex;
use tracing::{info, warn};

pub struct GpuManager {
    nvml: Mutex<Option<Nvml>>,
    device_count: u32,
}

fn map_nvml(context: &str, e: NvmlError) -> Error {
    match e {
        NvmlError::NotSupported | NvmlError::NoPermission | NvmlError::DriverNotLoaded => {
            Error::AdapterPermanent(format!("{context}: {e}"))
        }
        other => Error::AdapterTransient(format!("{context}: {other}")),
    }
}

impl GpuManager {
    pub fn new() -> Self {
        match Nvml::init() {
            Ok(nvml) => {
                let device_count = nvml.device_count().unwrap_or(0);
                info!(devices = device_count, "NVML initialized");
                Self {
                    nvml: Mutex::new(Some(nvml)),
                    device_count,
                }
            }
            Err(e) => {
                warn!("cannot initialize NVML: {e}; GPU management disabled");
                Self {
                    nvml: Mutex::new(None),
                    device_count: 0,
                }
            }
        }
    }

    pub fn available(&self) -> bool {
        self.device_count > 0 && self.nvml.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn with_nvml<T>(&self, context: &str, f: impl FnOnce(&Nvml) -> Result<T, NvmlError>) -> Result<T, Error> {
        let guard = self
            .nvml
            .lock()
            .map_err(|_| Error::AdapterTransient("nvml lock poisoned".into()))?;
        match guard.as_ref() {
            Some(nvml) => f(nvml).map_err(|e| map_nvml(context, e)),
            None => Err(Error::AdapterPermanent(format!("{context}: nvml not initialized"))),
        }
    }

    /// Total memory across all devices, MB.
    pub fn total_memory_mb(&self) -> f64 {
        self.sum_memory(|info| info.total)
    }

    /// Used memory across all devices, MB.
    pub fn used_memory_mb(&self) -> f64 {
        self.sum_memory(|info| info.used)
    }

    fn sum_memory(&self, pick: impl Fn(nvml_wrapper::struct_wrappers::device::MemoryInfo) -> u64) -> f64 {
        self.with_nvml("memory info", |nvml| {
            let mut total = 0u64;
            for i in 0..self.device_count {
                total += pick(nvml.device_by_index(i)?.memory_info()?);
            }
            Ok(total)
        })
        .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
    }

    /// Share of device memory currently in use, 0..100. The stand-in for
    /// per-process GPU accounting when the SDK offers none.
    pub fn memory_share_percent(&self) -> f32 {
        let total = self.total_memory_mb();
        if total <= 0.0 {
            return 0.0;
        }
        ((self.used_memory_mb() / total) * 100.0) as f32
    }

    /// Hottest device temperature in °C; sensor errors read as 0.
    pub fn max_temperature_c(&self) -> f32 {
        self.with_nvml("temperature", |nvml| {
            let mut max = 0u32;
            for i in 0..self.device_count {
                max = max.max(nvml.device_by_index(i)?.temperature(TemperatureSensor::Gpu)?);
            }
            Ok(max)
        })
        .map(|c| c as f32)
        .unwrap_or(0.0)
    }

    /// Total board power draw in W; sensor errors read as 0.
    pub fn total_power_w(&self) -> f64 {
        self.with_nvml("power usage", |nvml| {
            let mut mw = 0u64;
            for i in 0..self.device_count {
                mw += nvml.device_by_index(i)?.power_usage()? as u64;
            }
            Ok(mw)
        })
        .map(|mw| mw as f64 / 1000.0)
        .unwrap_or(0.0)
    }

    /// Current power-management limit of device 0, in W.
    pub fn power_limit_w(&self) -> Result<i64, Error> {
        self.with_nvml("power limit", |nvml| {
            nvml.device_by_index(0)?.power_management_limit()
        })
        .map(|mw| (mw / 1000) as i64)
    }

    /// Cap device 0 at `watts` via the power-management limit (mW).
    pub fn set_power_limit_w(&self, watts: i64) -> Result<(), Error> {
        if watts <= 0 {
            return Err(Error::AdapterTransient(format!(
                "refusing non-positive GPU power cap {watts} W"
            )));
        }
        self.with_nvml("set power limit", |nvml| {
            let mut device = nvml.device_by_index(0)?;
            device.set_power_management_limit(watts as u32 * 1000)
        })
    }

    /// Per-device utilization percentages.
    pub fn usage_percents(&self) -> Result<Vec<f64>, Error> {
        self.with_nvml("utilization", |nvml| {
            let mut out = Vec::with_capacity(self.device_count as usize);
            for i in 0..self.device_count {
                out.push(nvml.device_by_index(i)?.utilization_rates()?.gpu as f64);
            }
            Ok(out)
        })
    }

    /// Apply a per-device usage target by scaling each device's power limit
    /// between its min/max constraints. Extra entries are ignored; missing
    /// entries leave the device untouched.
    pub fn set_usage_percents(&self, percents: &[f64]) -> Result<(), Error> {
        self.with_nvml("set usage target", |nvml| {
            for (i, pct) in percents.iter().enumerate().take(self.device_count as usize) {
                let mut device = nvml.device_by_index(i as u32)?;
                let constraints = device.power_management_limit_constraints()?;
                let span = constraints.max_limit.saturating_sub(constraints.min_limit);
                let target =
                    constraints.min_limit + (span as f64 * (pct.clamp(0.0, 100.0) / 100.0)) as u32;
                device.set_power_management_limit(target)?;
            }
            Ok(())
        })
    }

    /// Release the library handle. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.nvml.lock() {
            if guard.take().is_some() {
                info!("NVML released");
            }
        }
    }
}

impl Default for GpuManager {
    fn default() -> Self {
        Self::new()
    }
}
