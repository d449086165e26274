//! Process registry: discovers managed workloads by name match, refreshes
//! their counters, and evicts entries whose OS process has vanished.
//! Discovery and sampling hold the single write lock; monitor and
//! optimizer readers share clones.

use crate::config::Config;
use crate::gpu::GpuManager;
use crate::process::ManagedProcess;
use std::collections::HashMap;
use sysinfo::{Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub registered: Vec<u32>,
    pub evicted: Vec<u32>,
}

struct Inner {
    sys: System,
    networks: Networks,
    procs: HashMap<u32, ManagedProcess>,
}

pub struct ProcessRegistry {
    inner: RwLock<Inner>,
    logical_cores: usize,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let logical_cores = sys.cpus().len().max(1);
        Self {
            inner: RwLock::new(Inner {
                sys,
                networks: Networks::new_with_refreshed_list(),
                procs: HashMap::new(),
            }),
            logical_cores,
        }
    }

    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    /// One monitor tick's worth of registry work: discover new matches,
    /// refresh counters on everything registered, evict the dead.
    pub async fn refresh(&self, cfg: &Config, gpu: &GpuManager) -> RefreshOutcome {
        let mut inner = self.inner.write().await;
        let Inner {
            sys,
            networks,
            procs,
        } = &mut *inner;

        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_memory()
                .with_disk_usage(),
        );
        sys.refresh_memory();
        networks.refresh(false);
        let total_memory = sys.total_memory();

        let mut outcome = RefreshOutcome::default();

        // Discovery: anything whose name matches a worker pattern.
        for p in sys.processes().values() {
            let pid = p.pid().as_u32();
            if procs.contains_key(&pid) {
                continue;
            }
            let name = p.name().to_string_lossy().into_owned();
            let gpu_eligible = matches_worker(&name, &cfg.processes.gpu);
            if !gpu_eligible && !matches_worker(&name, &cfg.processes.cpu) {
                continue;
            }
            let priority = cfg.priority_for(&name);
            info!(pid, process = %name, priority, gpu_eligible, "registered managed process");
            procs.insert(
                pid,
                ManagedProcess::new(
                    pid,
                    name,
                    priority,
                    cfg.network_interface.clone(),
                    gpu_eligible,
                ),
            );
            outcome.registered.push(pid);
        }

        // Sampling + eviction.
        let gpu_share = if gpu.available() {
            gpu.memory_share_percent()
        } else {
            0.0
        };
        let pids: Vec<u32> = procs.keys().copied().collect();
        for pid in pids {
            match sys.process(sysinfo::Pid::from_u32(pid)) {
                Some(live) => {
                    if let Some(entry) = procs.get_mut(&pid) {
                        entry.update_counters(live, networks, total_memory);
                        entry.gpu_usage = if entry.gpu_eligible { gpu_share } else { 0.0 };
                    }
                }
                None => {
                    info!(pid, "managed process is gone; evicting");
                    procs.remove(&pid);
                    outcome.evicted.push(pid);
                }
            }
        }
        debug!(
            managed = procs.len(),
            registered = outcome.registered.len(),
            evicted = outcome.evicted.len(),
            "registry refreshed"
        );
        outcome
    }

    pub async fn snapshots(&self) -> Vec<ManagedProcess> {
        let inner = self.inner.read().await;
        let mut out: Vec<ManagedProcess> = inner.procs.values().cloned().collect();
        out.sort_by_key(|p| p.pid);
        out
    }

    pub async fn get(&self, pid: u32) -> Option<ManagedProcess> {
        self.inner.read().await.procs.get(&pid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.procs.len()
    }

    /// Node RAM in MB, for the optimizer's feature vector.
    pub async fn total_memory_mb(&self) -> f64 {
        self.inner.read().await.sys.total_memory() as f64 / (1024.0 * 1024.0)
    }

    /// Flip the cloak flag. The executor is the only caller.
    pub async fn set_cloaked(&self, pid: u32, cloaked: bool) {
        if let Some(p) = self.inner.write().await.procs.get_mut(&pid) {
            p.is_cloaked = cloaked;
        }
    }

    /// Drop a process whose pid disappeared mid-adjustment.
    pub async fn remove(&self, pid: u32) -> Option<ManagedProcess> {
        self.inner.write().await.procs.remove(&pid)
    }

    /// Direct registration, bypassing discovery. Tests use this to stage
    /// processes that do not exist on the host.
    pub async fn insert(&self, process: ManagedProcess) {
        self.inner.write().await.procs.insert(process.pid, process);
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive substring match; an empty pattern matches nothing.
pub fn matches_worker(process_name: &str, pattern: &str) -> bool {
    !pattern.is_empty() && process_name.to_lowercase().contains(&pattern.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_matching_is_substring_and_case_insensitive() {
        assert!(matches_worker("CPU_Miner-v3", "cpu_miner"));
        assert!(matches_worker("gpu_miner", "GPU_MINER"));
        assert!(!matches_worker("bash", "cpu_miner"));
        assert!(!matches_worker("anything", ""));
    }

    #[tokio::test]
    async fn staged_processes_are_visible_and_removable() {
        let registry = ProcessRegistry::new();
        registry
            .insert(ManagedProcess::new(
                1001,
                "cpu_miner".into(),
                2,
                "eth0".into(),
                false,
            ))
            .await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(1001).await.unwrap().name, "cpu_miner");

        registry.set_cloaked(1001, true).await;
        assert!(registry.get(1001).await.unwrap().is_cloaked);

        let removed = registry.remove(1001).await.unwrap();
        assert_eq!(removed.pid, 1001);
        assert!(registry.get(1001).await.is_none());
    }

    #[tokio::test]
    async fn snapshots_are_sorted_by_pid() {
        let registry = ProcessRegistry::new();
        for pid in [30u32, 10, 20] {
            registry
                .insert(ManagedProcess::new(
                    pid,
                    format!("cpu_miner_{pid}"),
                    1,
                    "eth0".into(),
                    false,
                ))
                .await;
        }
        let pids: Vec<u32> = registry.snapshots().await.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![10, 20, 30]);
    }
}
