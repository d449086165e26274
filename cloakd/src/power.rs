//! Node thermal/power envelope and the sensors that feed it.
//! CPU temperature comes from hwmon components, CPU power from RAPL
//! energy counters. A failed probe reads as 0 and is never a reason to
//! throttle.

use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use sysinfo::Components;

/// Most-recent node readings. Written only by the monitor.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeEnvelope {
    pub cpu_temp_c: f32,
    pub gpu_temp_c: f32,
    pub cpu_power_w: f64,
    pub gpu_power_w: f64,
}

impl NodeEnvelope {
    /// A zero reading means the sensor was unavailable at probe time.
    pub fn reading_valid(v: f64) -> bool {
        v > 0.0
    }
}

pub struct CpuTempSensor {
    components: Components,
}

impl CpuTempSensor {
    pub fn new() -> Self {
        Self {
            components: Components::new_with_refreshed_list(),
        }
    }

    /// Package/core temperature in °C, or 0 when no matching sensor exists.
    pub fn probe(&mut self) -> f32 {
        self.components.refresh(false);
        self.components
            .iter()
            .find_map(|c| {
                if component_is_cpu(c.label()) {
                    c.temperature()
                } else {
                    None
                }
            })
            .unwrap_or(0.0)
    }
}

impl Default for CpuTempSensor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn component_is_cpu(label: &str) -> bool {
    let l = label.to_ascii_lowercase();
    l.contains("cpu") || l.contains("package") || l.contains("tctl") || l.contains("tdie")
}

/// Package power from RAPL `energy_uj` deltas. The first probe (and any
/// counter wrap) reads 0.
pub struct RaplPowerSensor {
    domains: Vec<PathBuf>,
    last: Option<(Instant, u64)>,
}

impl RaplPowerSensor {
    pub fn new() -> Self {
        Self {
            domains: discover_rapl_domains("/sys/class/powercap"),
            last: None,
        }
    }

    pub fn probe(&mut self) -> f64 {
        if self.domains.is_empty() {
            return 0.0;
        }
        let mut total_uj = 0u64;
        for domain in &self.domains {
            match fs::read_to_string(domain.join("energy_uj")) {
                Ok(raw) => total_uj += raw.trim().parse::<u64>().unwrap_or(0),
                Err(e) => {
                    tracing::debug!(domain = %domain.display(), "rapl read failed: {e}");
                    return 0.0;
                }
            }
        }
        let now = Instant::now();
        let watts = match self.last {
            Some((at, prev_uj)) if total_uj >= prev_uj => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    (total_uj - prev_uj) as f64 / 1_000_000.0 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        self.last = Some((now, total_uj));
        watts
    }
}

impl Default for RaplPowerSensor {
    fn default() -> Self {
        Self::new()
    }
}

fn discover_rapl_domains(base: &str) -> Vec<PathBuf> {
    let mut domains = Vec::new();
    if let Ok(entries) = fs::read_dir(base) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_package_domain(&name) {
                domains.push(entry.path());
            }
        }
    }
    domains.sort();
    domains
}

/// Top-level package domains only ("intel-rapl:0"); subdomains such as
/// "intel-rapl:0:0" would double-count.
pub fn is_package_domain(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("intel-rapl:") else {
        return false;
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_component_labels() {
        assert!(component_is_cpu("Package id 0"));
        assert!(component_is_cpu("Tctl"));
        assert!(component_is_cpu("coretemp CPU"));
        assert!(component_is_cpu("tdie"));
        assert!(!component_is_cpu("nvme composite"));
        assert!(!component_is_cpu("acpitz"));
    }

    #[test]
    fn package_domains_exclude_subdomains() {
        assert!(is_package_domain("intel-rapl:0"));
        assert!(is_package_domain("intel-rapl:1"));
        assert!(!is_package_domain("intel-rapl:0:0"));
        assert!(!is_package_domain("intel-rapl"));
        assert!(!is_package_domain("amd_energy"));
    }

    #[test]
    fn first_rapl_probe_reads_zero() {
        let mut sensor = RaplPowerSensor {
            domains: vec![],
            last: None,
        };
        assert_eq!(sensor.probe(), 0.0);
    }

    #[test]
    fn invalid_readings_are_never_valid() {
        assert!(!NodeEnvelope::reading_valid(0.0));
        assert!(!NodeEnvelope::reading_valid(-1.0));
        assert!(NodeEnvelope::reading_valid(42.5));
    }
}
