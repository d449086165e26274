//! Adjustment tasks and the priority queue the executor consumes.
//! Lower priority number means more urgent; ties break on insertion order.

use crate::model::ActionVector;
use std::collections::BTreeMap;
use std::fmt;

/// Restore tasks always outrank cloaks so a pending restore for a pid wins
/// over a cloak queued in the same window.
pub const PRIORITY_RESTORE: u8 = 1;
pub const PRIORITY_MONITOR: u8 = 2;
pub const PRIORITY_ACTION: u8 = 3;

/// The closed set of adjustable knobs, one OS adapter each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Knob {
    CpuFreq,
    CpuThreads,
    CpuNice,
    RamAllocationMb,
    GpuPowerLimit,
    GpuUsagePercent,
    IoniceClass,
    DiskIoLimitMbps,
    NetworkBandwidthLimitMbps,
    DropCaches,
}

impl Knob {
    pub fn name(&self) -> &'static str {
        match self {
            Knob::CpuFreq => "cpu_freq",
            Knob::CpuThreads => "cpu_threads",
            Knob::CpuNice => "cpu_nice",
            Knob::RamAllocationMb => "ram_allocation_mb",
            Knob::GpuPowerLimit => "gpu_power_limit",
            Knob::GpuUsagePercent => "gpu_usage_percent",
            Knob::IoniceClass => "ionice_class",
            Knob::DiskIoLimitMbps => "disk_io_limit_mbps",
            Knob::NetworkBandwidthLimitMbps => "network_bandwidth_limit_mbps",
            Knob::DropCaches => "drop_caches",
        }
    }

    /// Whether the knob participates in OriginalLimits. Dropping caches is
    /// fire-and-forget and has no value to put back.
    pub fn restorable(&self) -> bool {
        !matches!(self, Knob::DropCaches)
    }

    /// Knobs that only make sense for GPU-eligible processes.
    pub fn gpu_only(&self) -> bool {
        matches!(self, Knob::GpuPowerLimit | Knob::GpuUsagePercent)
    }
}

impl fmt::Display for Knob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KnobValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Percents(Vec<f64>),
}

impl fmt::Display for KnobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnobValue::Int(v) => write!(f, "{v}"),
            KnobValue::Float(v) => write!(f, "{v:.1}"),
            KnobValue::Bool(v) => write!(f, "{v}"),
            KnobValue::Percents(v) => {
                let joined: Vec<String> = v.iter().map(|p| format!("{p:.0}%")).collect();
                write!(f, "[{}]", joined.join(", "))
            }
        }
    }
}

impl KnobValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KnobValue::Int(v) => Some(*v),
            KnobValue::Float(v) => Some(v.round() as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KnobValue::Int(v) => Some(*v as f64),
            KnobValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Which cloak families a monitoring pass asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloakFlags {
    pub cpu: bool,
    pub gpu: bool,
    pub network: bool,
    pub cache: bool,
    pub disk_io: bool,
}

impl CloakFlags {
    pub fn any(&self) -> bool {
        self.cpu || self.gpu || self.network || self.cache || self.disk_io
    }

    /// Strategy names in the fixed application order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.cpu {
            out.push("cpu");
        }
        if self.gpu {
            out.push("gpu");
        }
        if self.network {
            out.push("network");
        }
        if self.cache {
            out.push("cache");
        }
        if self.disk_io {
            out.push("disk_io");
        }
        out
    }
}

/// One unit of work for the executor.
#[derive(Debug, Clone)]
pub enum AdjustmentTask {
    /// A single named knob adjustment.
    FunctionCall {
        pid: u32,
        process_name: String,
        knob: Knob,
        value: KnobValue,
    },
    /// Threshold-triggered cloak request from the monitor.
    Monitoring { pid: u32, flags: CloakFlags },
    /// Model-derived action vector.
    Optimization { pid: u32, action: ActionVector },
    /// Ordered list of strategy names from a collaborator.
    Cloaking { pid: u32, strategies: Vec<String> },
    /// Reapply the saved originals for a pid.
    Restore { pid: u32 },
}

impl AdjustmentTask {
    pub fn kind(&self) -> &'static str {
        match self {
            AdjustmentTask::FunctionCall { .. } => "function_call",
            AdjustmentTask::Monitoring { .. } => "monitoring",
            AdjustmentTask::Optimization { .. } => "optimization",
            AdjustmentTask::Cloaking { .. } => "cloaking",
            AdjustmentTask::Restore { .. } => "restore",
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            AdjustmentTask::FunctionCall { pid, .. }
            | AdjustmentTask::Monitoring { pid, .. }
            | AdjustmentTask::Optimization { pid, .. }
            | AdjustmentTask::Cloaking { pid, .. }
            | AdjustmentTask::Restore { pid } => *pid,
        }
    }
}

/// A task plus its urgency, as sent by producers.
#[derive(Debug, Clone)]
pub struct Submission {
    pub priority: u8,
    pub task: AdjustmentTask,
}

impl Submission {
    pub fn new(priority: u8, task: AdjustmentTask) -> Self {
        Self { priority, task }
    }
}

pub const QUEUE_CAPACITY: usize = 1024;

/// Priority-ordered pending set. Keyed by (priority, seq) so iteration
/// order is the execution order: strictly by priority, FIFO within one.
pub struct PendingQueue {
    entries: BTreeMap<(u8, u64), AdjustmentTask>,
    next_seq: u64,
    capacity: usize,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }
}

impl PendingQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a task. When full, the least-urgent pending optimization task
    /// is dropped first; an incoming optimization task that cannot displace
    /// anything is itself dropped.
    pub fn push(&mut self, priority: u8, task: AdjustmentTask) -> bool {
        if self.entries.len() >= self.capacity && !self.evict_for(priority, &task) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((priority, seq), task);
        true
    }

    fn evict_for(&mut self, priority: u8, incoming: &AdjustmentTask) -> bool {
        let victim = self
            .entries
            .iter()
            .rev()
            .find(|(_, t)| matches!(t, AdjustmentTask::Optimization { .. }))
            .map(|(k, _)| *k);
        match victim {
            // Never displace a more urgent pending task with a less urgent one.
            Some(key) if key.0 >= priority => {
                tracing::warn!(
                    priority = key.0,
                    "queue full; dropping pending optimization task"
                );
                self.entries.remove(&key);
                true
            }
            _ if matches!(incoming, AdjustmentTask::Optimization { .. }) => {
                tracing::warn!("queue full; dropping incoming optimization task");
                false
            }
            _ => true, // overflow transiently rather than lose a cloak/restore
        }
    }

    pub fn pop(&mut self) -> Option<(u8, AdjustmentTask)> {
        self.entries.pop_first().map(|((p, _), task)| (p, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restore(pid: u32) -> AdjustmentTask {
        AdjustmentTask::Restore { pid }
    }

    fn cloak(pid: u32) -> AdjustmentTask {
        AdjustmentTask::Monitoring {
            pid,
            flags: CloakFlags {
                cpu: true,
                ..Default::default()
            },
        }
    }

    fn optimize(pid: u32) -> AdjustmentTask {
        AdjustmentTask::Optimization {
            pid,
            action: ActionVector([0.0; 7]),
        }
    }

    #[test]
    fn pops_by_priority_then_fifo() {
        let mut q = PendingQueue::default();
        q.push(PRIORITY_ACTION, optimize(1));
        q.push(PRIORITY_MONITOR, cloak(2));
        q.push(PRIORITY_RESTORE, restore(3));
        q.push(PRIORITY_MONITOR, cloak(4));

        let order: Vec<u32> = std::iter::from_fn(|| q.pop()).map(|(_, t)| t.pid()).collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn restore_beats_cloak_for_same_pid() {
        let mut q = PendingQueue::default();
        q.push(PRIORITY_MONITOR, cloak(9));
        q.push(PRIORITY_RESTORE, restore(9));
        let (_, first) = q.pop().unwrap();
        assert!(matches!(first, AdjustmentTask::Restore { pid: 9 }));
    }

    #[test]
    fn full_queue_drops_least_urgent_optimization_first() {
        let mut q = PendingQueue::with_capacity(2);
        assert!(q.push(PRIORITY_ACTION, optimize(1)));
        assert!(q.push(PRIORITY_ACTION, optimize(2)));
        // A restore displaces the newest pending optimization.
        assert!(q.push(PRIORITY_RESTORE, restore(3)));
        let order: Vec<&'static str> =
            std::iter::from_fn(|| q.pop()).map(|(_, t)| t.kind()).collect();
        assert_eq!(order, vec!["restore", "optimization"]);
    }

    #[test]
    fn incoming_optimization_dropped_when_nothing_to_evict() {
        let mut q = PendingQueue::with_capacity(1);
        assert!(q.push(PRIORITY_RESTORE, restore(1)));
        assert!(!q.push(PRIORITY_ACTION, optimize(2)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn flags_expand_in_fixed_order() {
        let flags = CloakFlags {
            cpu: true,
            gpu: false,
            network: true,
            cache: true,
            disk_io: false,
        };
        assert_eq!(flags.strategy_names(), vec!["cpu", "network", "cache"]);
        assert!(flags.any());
        assert!(!CloakFlags::default().any());
    }
}
