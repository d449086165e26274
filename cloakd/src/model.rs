//! Pretrained action model: a linear policy loaded from a JSON artifact.
//! Per process and optimizer tick it maps a six-feature sample to a
//! seven-entry action vector, clamped to the configured envelopes.

use crate::config::Config;
use crate::error::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Feature order: CPU %, RAM MB, GPU %, disk I/O Mbps, network Mbps,
/// cache limit %.
pub const FEATURE_LEN: usize = 6;

/// Action order: cpu_threads, ram_mb, gpu_usage_0..2, disk_io_mbps,
/// net_mbps. Seven entries; the artifact is rejected on any other shape.
pub const ACTION_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct ActionVector(pub [f64; ACTION_LEN]);

impl ActionVector {
    pub fn cpu_threads(&self) -> i64 {
        self.0[0].round() as i64
    }
    pub fn ram_mb(&self) -> i64 {
        self.0[1].round() as i64
    }
    pub fn gpu_usage(&self) -> [f64; 3] {
        [self.0[2], self.0[3], self.0[4]]
    }
    pub fn disk_io_mbps(&self) -> f64 {
        self.0[5]
    }
    pub fn net_mbps(&self) -> f64 {
        self.0[6]
    }
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

/// Output clamps derived from the config at load time.
#[derive(Debug, Clone)]
pub struct ActionLimits {
    pub max_threads: f64,
    pub max_ram_mb: f64,
    pub disk_min_mbps: f64,
    pub disk_max_mbps: f64,
    pub net_max_mbps: f64,
}

impl ActionLimits {
    pub fn from_config(cfg: &Config, logical_cores: usize) -> Self {
        Self {
            max_threads: logical_cores.max(1) as f64,
            max_ram_mb: cfg.resource_allocation.ram.max_allocation_mb as f64,
            disk_min_mbps: cfg.resource_allocation.disk_io.min_limit_mbps,
            disk_max_mbps: cfg.resource_allocation.disk_io.max_limit_mbps,
            net_max_mbps: cfg.resource_allocation.network.bandwidth_limit_mbps,
        }
    }
}

pub struct ActionModel {
    weights: Vec<[f64; FEATURE_LEN]>,
    bias: [f64; ACTION_LEN],
    limits: ActionLimits,
}

impl ActionModel {
    pub fn load(path: &Path, limits: ActionLimits) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::InitFailure(format!("cannot read model {}: {e}", path.display())))?;
        let file: ModelFile = serde_json::from_str(&raw)
            .map_err(|e| Error::InitFailure(format!("model {}: {e}", path.display())))?;
        Self::from_parts(file, limits)
    }

    fn from_parts(file: ModelFile, limits: ActionLimits) -> Result<Self, Error> {
        // Shape check against the trained artifact: exactly 7 rows of 6.
        if file.weights.len() != ACTION_LEN || file.bias.len() != ACTION_LEN {
            return Err(Error::InitFailure(format!(
                "model emits {} actions, expected {ACTION_LEN}",
                file.weights.len().max(file.bias.len())
            )));
        }
        let mut weights = Vec::with_capacity(ACTION_LEN);
        for row in &file.weights {
            let fixed: [f64; FEATURE_LEN] = row.as_slice().try_into().map_err(|_| {
                Error::InitFailure(format!(
                    "model row has {} features, expected {FEATURE_LEN}",
                    row.len()
                ))
            })?;
            weights.push(fixed);
        }
        let bias: [f64; ACTION_LEN] = file.bias.as_slice().try_into().expect("length checked");
        Ok(Self {
            weights,
            bias,
            limits,
        })
    }

    pub fn infer(&self, features: &[f64; FEATURE_LEN]) -> ActionVector {
        let mut out = [0.0; ACTION_LEN];
        for (i, row) in self.weights.iter().enumerate() {
            let dot: f64 = row.iter().zip(features.iter()).map(|(w, x)| w * x).sum();
            out[i] = dot + self.bias[i];
        }
        self.clamp(&mut out);
        ActionVector(out)
    }

    fn clamp(&self, out: &mut [f64; ACTION_LEN]) {
        out[0] = out[0].clamp(1.0, self.limits.max_threads).round();
        out[1] = out[1].clamp(1.0, self.limits.max_ram_mb).round();
        for v in &mut out[2..5] {
            *v = v.clamp(0.0, 100.0);
        }
        out[5] = out[5].clamp(self.limits.disk_min_mbps, self.limits.disk_max_mbps);
        out[6] = out[6].clamp(1.0, self.limits.net_max_mbps);
    }
}
