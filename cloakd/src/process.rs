//! Per-process data model: identity, live counters, and the network tag
//! used by packet-matching adapters.

use serde::Serialize;
use sysinfo::Networks;

/// Minimal identity handed to adapters. Carries everything an adapter may
/// need to address the process without touching the registry.
#[derive(Debug, Clone)]
pub struct ProcessView {
    pub pid: u32,
    pub name: String,
    pub network_interface: String,
    pub mark: u16,
    pub gpu_eligible: bool,
}

/// A registered workload instance. Identity fields never change after
/// registration; counters are rewritten by the sampler each tick.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedProcess {
    pub pid: u32,
    pub name: String,
    pub priority: i32,

    pub cpu_usage: f32,
    pub memory_percent: f32,
    /// Cumulative read+write MB since process start.
    pub disk_io_mb: f64,
    /// MB read+written since the previous sample.
    pub disk_io_delta_mb: f64,
    /// MB sent+received on the bound interface since the previous sample.
    /// The first sample after registration is defined as zero.
    pub network_io_mb: f64,
    pub gpu_usage: f32,

    /// 16-bit packet mark (pid mod 65535) for interface-level matching.
    pub mark: u16,
    pub network_interface: String,
    pub gpu_eligible: bool,
    pub is_cloaked: bool,

    #[serde(skip)]
    prev_net: Option<(u64, u64)>,
    #[serde(skip)]
    prev_disk_mb: Option<f64>,
}

impl ManagedProcess {
    pub fn new(
        pid: u32,
        name: String,
        priority: i32,
        network_interface: String,
        gpu_eligible: bool,
    ) -> Self {
        Self {
            pid,
            name,
            priority,
            cpu_usage: 0.0,
            memory_percent: 0.0,
            disk_io_mb: 0.0,
            disk_io_delta_mb: 0.0,
            network_io_mb: 0.0,
            gpu_usage: 0.0,
            mark: (pid % 65535) as u16,
            network_interface,
            gpu_eligible,
            is_cloaked: false,
            prev_net: None,
            prev_disk_mb: None,
        }
    }

    pub fn view(&self) -> ProcessView {
        ProcessView {
            pid: self.pid,
            name: self.name.clone(),
            network_interface: self.network_interface.clone(),
            mark: self.mark,
            gpu_eligible: self.gpu_eligible,
        }
    }

    /// Refresh counters from a live sysinfo snapshot.
    pub fn update_counters(
        &mut self,
        proc_: &sysinfo::Process,
        networks: &Networks,
        total_memory_bytes: u64,
    ) {
        // Per-process CPU is relative to one core; multi-threaded workers
        // legitimately exceed 100.
        self.cpu_usage = proc_.cpu_usage().max(0.0);
        self.memory_percent = if total_memory_bytes > 0 {
            (proc_.memory() as f32 / total_memory_bytes as f32) * 100.0
        } else {
            0.0
        };

        let disk = proc_.disk_usage();
        let cumulative_mb =
            (disk.total_read_bytes + disk.total_written_bytes) as f64 / (1024.0 * 1024.0);
        self.disk_io_delta_mb = disk_delta_mb(&mut self.prev_disk_mb, cumulative_mb);
        self.disk_io_mb = cumulative_mb;

        let mut seen = false;
        for (name, data) in networks.iter() {
            if name == &self.network_interface {
                self.network_io_mb = net_delta_mb(
                    &mut self.prev_net,
                    data.total_transmitted(),
                    data.total_received(),
                );
                seen = true;
                break;
            }
        }
        if !seen {
            tracing::warn!(
                pid = self.pid,
                interface = %self.network_interface,
                "network interface not found; reporting 0 MB"
            );
            self.network_io_mb = 0.0;
        }
    }

    /// Clear the byte snapshot so the next sample reports 0 MB again.
    /// Collaborators use this to re-baseline after an interface change.
    #[allow(dead_code)]
    pub fn reset_network_io(&mut self) {
        self.prev_net = None;
        self.network_io_mb = 0.0;
    }
}

/// Delta of a cumulative MB counter; first observation yields zero.
pub fn disk_delta_mb(prev: &mut Option<f64>, current_mb: f64) -> f64 {
    let delta = match prev {
        Some(last) => (current_mb - *last).max(0.0),
        None => 0.0,
    };
    *prev = Some(current_mb);
    delta
}

/// Delta of interface byte totals in MB; first observation yields zero.
pub fn net_delta_mb(prev: &mut Option<(u64, u64)>, sent: u64, recv: u64) -> f64 {
    let delta = match prev {
        Some((last_sent, last_recv)) => {
            let sent_diff = sent.saturating_sub(*last_sent);
            let recv_diff = recv.saturating_sub(*last_recv);
            (sent_diff + recv_diff) as f64 / (1024.0 * 1024.0)
        }
        None => 0.0,
    };
    *prev = Some((sent, recv));
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_network_sample_is_zero() {
        let mut prev = None;
        assert_eq!(net_delta_mb(&mut prev, 5_000_000, 7_000_000), 0.0);
        // second sample reports the delta in MB
        let mb = net_delta_mb(&mut prev, 5_000_000 + 1_048_576, 7_000_000 + 1_048_576);
        assert!((mb - 2.0).abs() < 1e-9);
    }

    #[test]
    fn counter_reset_does_not_go_negative() {
        let mut prev = Some((10_000_000, 10_000_000));
        // interface counters reset (e.g. driver reload)
        let mb = net_delta_mb(&mut prev, 100, 100);
        assert_eq!(mb, 0.0);
    }

    #[test]
    fn disk_delta_tracks_cumulative_counter() {
        let mut prev = None;
        assert_eq!(disk_delta_mb(&mut prev, 120.0), 0.0);
        assert!((disk_delta_mb(&mut prev, 128.5) - 8.5).abs() < 1e-9);
        // cumulative counters never decrease; clamp if they appear to
        assert_eq!(disk_delta_mb(&mut prev, 100.0), 0.0);
    }

    #[test]
    fn reset_network_io_forces_zero_next_sample() {
        let mut p = ManagedProcess::new(1001, "cpu_miner".into(), 2, "eth0".into(), false);
        let _ = net_delta_mb(&mut p.prev_net, 1, 1);
        p.reset_network_io();
        assert!(p.prev_net.is_none());
        assert_eq!(p.network_io_mb, 0.0);
    }

    #[test]
    fn mark_is_pid_mod_16bit() {
        let p = ManagedProcess::new(70_000, "gpu_miner".into(), 3, "eth0".into(), true);
        assert_eq!(p.mark, (70_000 % 65_535) as u16);
    }
}
