//! The adjustment executor: sole consumer of the priority queue and sole
//! caller of the OS adapters. Serialises every mutation of system state,
//! snapshots originals on first touch, and puts them back on restore.

use crate::adapters::KnobBackend;
use crate::config::Config;
use crate::error::Error;
use crate::model::ActionVector;
use crate::process::ProcessView;
use crate::queue::{
    AdjustmentTask, Knob, KnobValue, PendingQueue, Submission, PRIORITY_ACTION,
};
use crate::registry::ProcessRegistry;
use crate::strategy::Strategy;
use crate::supervisor::ShutdownSignal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long the shutdown sequence keeps working the queue before forcing
/// restores.
pub const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(10);

const QUEUE_IDLE_WAIT: Duration = Duration::from_millis(250);

/// Pre-adjustment snapshot of a single knob.
#[derive(Debug, Clone, PartialEq)]
pub enum SavedLimit {
    Known(KnobValue),
    /// The pre-read failed. The write still went ahead; restore skips it.
    Unknown,
}

pub type OriginalLimits = HashMap<u32, BTreeMap<Knob, SavedLimit>>;

#[derive(Debug)]
pub struct ExecutorReport {
    pub tasks_executed: u64,
    pub restore_failures: usize,
    pub residual_pids: Vec<u32>,
}

pub struct Executor {
    backend: Arc<dyn KnobBackend>,
    registry: Arc<ProcessRegistry>,
    cfg: Arc<Config>,
    rx: mpsc::UnboundedReceiver<Submission>,
    queue: PendingQueue,
    originals: OriginalLimits,
    last_actions: HashMap<u32, ActionVector>,
    disabled: HashSet<Knob>,
    gpu_available: bool,
    logical_cores: usize,
    stop: ShutdownSignal,
    tasks_executed: u64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn KnobBackend>,
        registry: Arc<ProcessRegistry>,
        cfg: Arc<Config>,
        rx: mpsc::UnboundedReceiver<Submission>,
        stop: ShutdownSignal,
        gpu_available: bool,
        logical_cores: usize,
    ) -> Self {
        Self {
            backend,
            registry,
            cfg,
            rx,
            queue: PendingQueue::default(),
            originals: OriginalLimits::new(),
            last_actions: HashMap::new(),
            disabled: HashSet::new(),
            gpu_available,
            logical_cores: logical_cores.max(1),
            stop,
            tasks_executed: 0,
        }
    }

    /// Main loop: drain producers into the priority queue, execute in
    /// strict (priority, insertion) order, idle with a short timeout.
    pub async fn run(mut self) -> ExecutorReport {
        info!("adjustment executor started");
        loop {
            while let Ok(sub) = self.rx.try_recv() {
                self.queue.push(sub.priority, sub.task);
            }
            if self.stop.is_set() {
                break;
            }
            if let Some((_, task)) = self.queue.pop() {
                self.execute(task).await;
                continue;
            }
            tokio::select! {
                _ = self.stop.wait() => {}
                received = self.rx.recv() => match received {
                    Some(sub) => {
                        self.queue.push(sub.priority, sub.task);
                    }
                    None => break,
                },
                _ = tokio::time::sleep(QUEUE_IDLE_WAIT) => {}
            }
        }
        self.finish().await
    }

    /// Shutdown: work the remaining queue inside the drain budget, then
    /// force a restore for every pid still holding saved limits.
    async fn finish(mut self) -> ExecutorReport {
        info!(pending = self.queue.len(), "shutdown: draining adjustment queue");
        let deadline = Instant::now() + SHUTDOWN_DRAIN_BUDGET;
        loop {
            while let Ok(sub) = self.rx.try_recv() {
                self.queue.push(sub.priority, sub.task);
            }
            if Instant::now() >= deadline {
                if !self.queue.is_empty() {
                    warn!(
                        dropped = self.queue.len(),
                        "shutdown budget exhausted; dropping pending tasks"
                    );
                }
                break;
            }
            match self.queue.pop() {
                Some((_, task)) => self.execute(task).await,
                None => break,
            }
        }

        let pids: Vec<u32> = self.originals.keys().copied().collect();
        let mut restore_failures = 0;
        for pid in pids {
            if self.restore_resources(pid).await.is_err() {
                restore_failures += 1;
            }
        }
        let residual_pids: Vec<u32> = self.originals.keys().copied().collect();
        for (pid, limits) in &self.originals {
            warn!(pid, ?limits, "residual limits after shutdown restore");
        }
        info!(
            executed = self.tasks_executed,
            restore_failures,
            residuals = residual_pids.len(),
            "adjustment executor stopped"
        );
        ExecutorReport {
            tasks_executed: self.tasks_executed,
            restore_failures,
            residual_pids,
        }
    }

    async fn execute(&mut self, task: AdjustmentTask) {
        self.tasks_executed += 1;
        debug!(kind = task.kind(), pid = task.pid(), "executing task");
        match task {
            AdjustmentTask::FunctionCall {
                pid,
                process_name,
                knob,
                value,
            } => {
                let Some(view) = self.view_of(pid).await else {
                    return;
                };
                if let Err(e) = self.apply_knob(&view, knob, &value).await {
                    debug!(pid, process = %process_name, %knob, "adjustment failed: {e}");
                }
            }
            AdjustmentTask::Monitoring { pid, flags } => {
                for name in flags.strategy_names() {
                    if let Err(e) = self.apply_cloak_strategy(name, pid).await {
                        warn!(pid, strategy = name, "cloak failed: {e}");
                    }
                }
            }
            AdjustmentTask::Cloaking { pid, strategies } => {
                for name in &strategies {
                    if let Err(e) = self.apply_cloak_strategy(name, pid).await {
                        warn!(pid, strategy = %name, "cloak failed: {e}");
                    }
                }
            }
            AdjustmentTask::Optimization { pid, action } => {
                if let Err(e) = self.apply_recommended_action(pid, action).await {
                    warn!(pid, "optimization action failed: {e}");
                }
            }
            AdjustmentTask::Restore { pid } => {
                if let Err(e) = self.restore_resources(pid).await {
                    warn!(pid, "restore incomplete: {e}");
                }
            }
        }
    }

    async fn view_of(&mut self, pid: u32) -> Option<ProcessView> {
        match self.registry.get(pid).await {
            Some(p) => Some(p.view()),
            None => {
                self.handle_process_gone(pid).await;
                None
            }
        }
    }

    /// Write one knob, snapshotting its current value first if this is the
    /// first touch for this pid.
    async fn apply_knob(
        &mut self,
        view: &ProcessView,
        knob: Knob,
        value: &KnobValue,
    ) -> Result<(), Error> {
        if self.disabled.contains(&knob) {
            debug!(%knob, "knob disabled for this session; skipping");
            return Ok(());
        }
        if knob.gpu_only() && !view.gpu_eligible {
            debug!(pid = view.pid, %knob, "process not gpu-eligible; dropping gpu knob");
            return Ok(());
        }
        if knob == Knob::CpuThreads {
            match value.as_i64() {
                Some(n) if n >= 1 && n as usize <= self.logical_cores => {}
                _ => {
                    warn!(
                        pid = view.pid,
                        requested = %value,
                        limit = self.logical_cores,
                        "cpu thread request out of range; ignoring"
                    );
                    return Ok(());
                }
            }
        }

        let backend = self.backend.clone();
        let mut first_touch = false;
        if knob.restorable()
            && !self
                .originals
                .get(&view.pid)
                .is_some_and(|m| m.contains_key(&knob))
        {
            first_touch = true;
            let saved = match backend.read(view, knob).await {
                Ok(current) => SavedLimit::Known(current),
                Err(Error::ProcessGone(pid)) => {
                    self.handle_process_gone(pid).await;
                    return Err(Error::ProcessGone(pid));
                }
                Err(e) => {
                    warn!(pid = view.pid, %knob, "cannot read current value: {e}; recording unknown");
                    SavedLimit::Unknown
                }
            };
            self.originals.entry(view.pid).or_default().insert(knob, saved);
        }

        match backend.apply(view, knob, value).await {
            Ok(()) => {
                info!(pid = view.pid, %knob, value = %value, "applied adjustment");
                Ok(())
            }
            Err(e) => {
                // The write never landed; an original captured just now
                // would claim otherwise.
                if first_touch {
                    if let Some(m) = self.originals.get_mut(&view.pid) {
                        m.remove(&knob);
                        if m.is_empty() {
                            self.originals.remove(&view.pid);
                        }
                    }
                }
                match &e {
                    Error::AdapterPermanent(_) => {
                        error!(%knob, "{e}; disabling knob for this session");
                        self.disabled.insert(knob);
                    }
                    Error::ProcessGone(pid) => self.handle_process_gone(*pid).await,
                    _ => warn!(pid = view.pid, %knob, "adjustment failed: {e}"),
                }
                Err(e)
            }
        }
    }

    /// Build the named strategy, derive its adjustments, snapshot untouched
    /// originals, and dispatch every knob. Construction failures raise.
    async fn apply_cloak_strategy(&mut self, name: &str, pid: u32) -> Result<(), Error> {
        let strategy = Strategy::create(name, &self.cfg, self.gpu_available, self.logical_cores)?;
        let Some(process) = self.registry.get(pid).await else {
            self.handle_process_gone(pid).await;
            return Err(Error::ProcessGone(pid));
        };
        let adjustments = strategy.derive(&process);
        if adjustments.is_empty() {
            info!(pid, strategy = name, "strategy produced no adjustments");
            return Ok(());
        }
        debug!(pid, strategy = name, count = adjustments.len(), "applying cloak adjustments");
        let view = process.view();
        for (knob, value) in &adjustments {
            // Individual knob failures are logged and must not stop the
            // rest of the map.
            let _ = self.apply_knob(&view, *knob, value).await;
        }
        self.registry.set_cloaked(pid, true).await;
        Ok(())
    }

    /// Fan an action vector out into function-call tasks, skipping the
    /// components that match the previous application, then queue a cache
    /// cloak behind them.
    async fn apply_recommended_action(
        &mut self,
        pid: u32,
        action: ActionVector,
    ) -> Result<(), Error> {
        let Some(process) = self.registry.get(pid).await else {
            self.handle_process_gone(pid).await;
            return Err(Error::ProcessGone(pid));
        };
        let name = process.name.clone();

        let last = self.last_actions.get(&pid);
        let changed = |idx: usize| last.is_none_or(|prev| prev.0[idx] != action.0[idx]);

        let mut calls: Vec<(Knob, KnobValue)> = Vec::new();
        if changed(0) {
            calls.push((Knob::CpuThreads, KnobValue::Int(action.cpu_threads())));
        }
        if changed(1) {
            calls.push((Knob::RamAllocationMb, KnobValue::Int(action.ram_mb())));
        }
        if (2..5).any(changed) {
            calls.push((
                Knob::GpuUsagePercent,
                KnobValue::Percents(action.gpu_usage().to_vec()),
            ));
        }
        if changed(5) {
            calls.push((Knob::DiskIoLimitMbps, KnobValue::Float(action.disk_io_mbps())));
        }
        if changed(6) {
            calls.push((
                Knob::NetworkBandwidthLimitMbps,
                KnobValue::Float(action.net_mbps()),
            ));
        }

        if calls.is_empty() {
            debug!(pid, "action identical to previous application; no net change");
            return Ok(());
        }
        for (knob, value) in calls {
            self.queue.push(
                PRIORITY_ACTION,
                AdjustmentTask::FunctionCall {
                    pid,
                    process_name: name.clone(),
                    knob,
                    value,
                },
            );
        }
        self.queue.push(
            PRIORITY_ACTION,
            AdjustmentTask::Cloaking {
                pid,
                strategies: vec!["cache".into()],
            },
        );
        self.last_actions.insert(pid, action);
        Ok(())
    }

    /// Put back every saved knob for a pid. Entries restore one by one;
    /// a partial failure keeps the remainder for a later retry.
    async fn restore_resources(&mut self, pid: u32) -> Result<(), Error> {
        let Some(limits) = self.originals.get(&pid) else {
            debug!(pid, "no saved limits to restore");
            return Ok(());
        };
        let view = match self.registry.get(pid).await {
            Some(p) => p.view(),
            None => {
                info!(pid, "process gone; discarding saved limits");
                self.originals.remove(&pid);
                self.last_actions.remove(&pid);
                return Ok(());
            }
        };

        let entries: Vec<(Knob, SavedLimit)> =
            limits.iter().map(|(k, v)| (*k, v.clone())).collect();
        let backend = self.backend.clone();
        let mut failed = false;
        for (knob, saved) in entries {
            match saved {
                SavedLimit::Unknown => {
                    warn!(pid, %knob, "original value unknown; skipping restore");
                    self.forget_original(pid, knob);
                }
                SavedLimit::Known(_) if self.disabled.contains(&knob) => {
                    warn!(pid, %knob, "knob disabled; cannot restore");
                    self.forget_original(pid, knob);
                }
                SavedLimit::Known(value) => match backend.apply(&view, knob, &value).await {
                    Ok(()) => {
                        info!(pid, %knob, value = %value, "restored original value");
                        self.forget_original(pid, knob);
                    }
                    Err(Error::ProcessGone(_)) => {
                        self.handle_process_gone(pid).await;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(pid, %knob, "restore failed: {e}; keeping entry for retry");
                        failed = true;
                    }
                },
            }
        }

        if failed {
            return Err(Error::AdapterTransient(format!(
                "restore incomplete for pid {pid}"
            )));
        }
        self.originals.remove(&pid);
        self.last_actions.remove(&pid);
        self.registry.set_cloaked(pid, false).await;
        info!(pid, "all resources restored");
        Ok(())
    }

    fn forget_original(&mut self, pid: u32, knob: Knob) {
        if let Some(m) = self.originals.get_mut(&pid) {
            m.remove(&knob);
        }
    }

    async fn handle_process_gone(&mut self, pid: u32) {
        info!(pid, "process gone; dropping registry entry and saved limits");
        self.originals.remove(&pid);
        self.last_actions.remove(&pid);
        self.registry.remove(pid).await;
    }

    #[cfg(test)]
    fn originals(&self) -> &OriginalLimits {
        &self.originals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ManagedProcess;
    use crate::queue::{CloakFlags, PRIORITY_MONITOR};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct MockBackend {
        /// Every apply attempt, successful or not.
        calls: StdMutex<Vec<(u32, Knob, KnobValue)>>,
        current: StdMutex<HashMap<(u32, Knob), KnobValue>>,
        fail_apply: StdMutex<HashMap<Knob, Error>>,
        fail_read: StdMutex<HashMap<Knob, Error>>,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                current: StdMutex::new(HashMap::new()),
                fail_apply: StdMutex::new(HashMap::new()),
                fail_read: StdMutex::new(HashMap::new()),
            })
        }

        fn default_value(knob: Knob) -> KnobValue {
            match knob {
                Knob::CpuFreq => KnobValue::Int(3500),
                Knob::CpuThreads => KnobValue::Int(8),
                Knob::CpuNice => KnobValue::Int(0),
                Knob::RamAllocationMb => KnobValue::Int(8192),
                Knob::GpuPowerLimit => KnobValue::Int(250),
                Knob::GpuUsagePercent => KnobValue::Percents(vec![90.0, 90.0, 90.0]),
                Knob::IoniceClass => KnobValue::Int(2),
                Knob::DiskIoLimitMbps => KnobValue::Float(100.0),
                Knob::NetworkBandwidthLimitMbps => KnobValue::Float(0.0),
                Knob::DropCaches => KnobValue::Bool(false),
            }
        }

        fn applied(&self) -> Vec<(u32, Knob, KnobValue)> {
            self.calls.lock().unwrap().clone()
        }

        fn applied_knobs(&self) -> Vec<Knob> {
            self.applied().iter().map(|(_, k, _)| *k).collect()
        }

        fn fail_applies_with(&self, knob: Knob, err: Error) {
            self.fail_apply.lock().unwrap().insert(knob, err);
        }

        fn fail_reads_with(&self, knob: Knob, err: Error) {
            self.fail_read.lock().unwrap().insert(knob, err);
        }

        fn clear_failures(&self) {
            self.fail_apply.lock().unwrap().clear();
            self.fail_read.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl KnobBackend for MockBackend {
        async fn apply(
            &self,
            target: &ProcessView,
            knob: Knob,
            value: &KnobValue,
        ) -> Result<(), Error> {
            self.calls
                .lock()
                .unwrap()
                .push((target.pid, knob, value.clone()));
            if let Some(err) = self.fail_apply.lock().unwrap().get(&knob) {
                return Err(err.clone());
            }
            if knob.restorable() {
                self.current
                    .lock()
                    .unwrap()
                    .insert((target.pid, knob), value.clone());
            }
            Ok(())
        }

        async fn read(&self, target: &ProcessView, knob: Knob) -> Result<KnobValue, Error> {
            if let Some(err) = self.fail_read.lock().unwrap().get(&knob) {
                return Err(err.clone());
            }
            Ok(self
                .current
                .lock()
                .unwrap()
                .get(&(target.pid, knob))
                .cloned()
                .unwrap_or_else(|| Self::default_value(knob)))
        }
    }

    struct Harness {
        executor: Executor,
        backend: Arc<MockBackend>,
        registry: Arc<ProcessRegistry>,
        tx: mpsc::UnboundedSender<Submission>,
        stop: ShutdownSignal,
    }

    async fn harness(gpu_available: bool) -> Harness {
        let backend = MockBackend::new();
        let registry = Arc::new(ProcessRegistry::new());
        let mut cfg = Config::default();
        cfg.resource_allocation.gpu.max_usage_percent = vec![60.0, 70.0, 40.0];
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = ShutdownSignal::new();
        let executor = Executor::new(
            backend.clone(),
            registry.clone(),
            Arc::new(cfg),
            rx,
            stop.clone(),
            gpu_available,
            8,
        );
        Harness {
            executor,
            backend,
            registry,
            tx,
            stop,
        }
    }

    async fn stage(registry: &ProcessRegistry, pid: u32, name: &str, gpu: bool) {
        registry
            .insert(ManagedProcess::new(
                pid,
                name.into(),
                2,
                "eth0".into(),
                gpu,
            ))
            .await;
    }

    #[tokio::test]
    async fn cloak_then_restore_round_trips_originals() {
        let mut h = harness(false).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;

        h.executor
            .execute(AdjustmentTask::Monitoring {
                pid: 1001,
                flags: CloakFlags {
                    cpu: true,
                    ..Default::default()
                },
            })
            .await;

        let saved = h.executor.originals().get(&1001).expect("limits saved");
        assert!(matches!(saved.get(&Knob::CpuFreq), Some(SavedLimit::Known(_))));
        assert!(matches!(
            saved.get(&Knob::CpuThreads),
            Some(SavedLimit::Known(_))
        ));
        assert!(h.registry.get(1001).await.unwrap().is_cloaked);

        h.executor
            .execute(AdjustmentTask::Restore { pid: 1001 })
            .await;
        assert!(h.executor.originals().get(&1001).is_none());
        assert!(!h.registry.get(1001).await.unwrap().is_cloaked);

        // the last writes put the defaults back
        let freq_writes: Vec<KnobValue> = h
            .backend
            .applied()
            .into_iter()
            .filter(|(_, k, _)| *k == Knob::CpuFreq)
            .map(|(_, _, v)| v)
            .collect();
        assert_eq!(freq_writes.last(), Some(&KnobValue::Int(3500)));
    }

    #[tokio::test]
    async fn optimization_action_orders_calls_and_records_each_knob_once() {
        let mut h = harness(true).await;
        stage(&h.registry, 1002, "gpu_miner", true).await;

        let action = ActionVector([4.0, 2048.0, 60.0, 70.0, 40.0, 30.0, 25.0]);
        h.executor
            .execute(AdjustmentTask::Optimization {
                pid: 1002,
                action: action.clone(),
            })
            .await;

        // queued function calls run in insertion order, cache cloak last
        while let Some((_, task)) = h.executor.queue.pop() {
            h.executor.execute(task).await;
        }

        let knobs = h.backend.applied_knobs();
        assert_eq!(
            knobs,
            vec![
                Knob::CpuThreads,
                Knob::RamAllocationMb,
                Knob::GpuUsagePercent,
                Knob::DiskIoLimitMbps,
                Knob::NetworkBandwidthLimitMbps,
                Knob::DropCaches,
            ]
        );
        let saved = h.executor.originals().get(&1002).expect("limits saved");
        assert_eq!(saved.len(), 5);
        assert!(!saved.contains_key(&Knob::DropCaches));

        // identical action again: no components differ, nothing new queued
        h.executor
            .execute(AdjustmentTask::Optimization { pid: 1002, action })
            .await;
        assert!(h.executor.queue.is_empty());
        assert_eq!(h.executor.originals().get(&1002).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn permanent_gpu_failure_disables_only_that_knob() {
        let mut h = harness(true).await;
        stage(&h.registry, 1002, "gpu_miner", true).await;
        h.backend.fail_applies_with(
            Knob::GpuPowerLimit,
            Error::AdapterPermanent("nvml: not supported".into()),
        );

        h.executor
            .execute(AdjustmentTask::Cloaking {
                pid: 1002,
                strategies: vec!["gpu".into()],
            })
            .await;
        // the other gpu knob still applied
        assert!(h.backend.applied_knobs().contains(&Knob::GpuUsagePercent));
        let attempts = |knob: Knob| {
            h.backend
                .applied_knobs()
                .iter()
                .filter(|k| **k == knob)
                .count()
        };
        assert_eq!(attempts(Knob::GpuPowerLimit), 1);

        // second pass: the disabled knob is skipped without another attempt
        h.executor
            .execute(AdjustmentTask::Cloaking {
                pid: 1002,
                strategies: vec!["gpu".into()],
            })
            .await;
        assert_eq!(attempts(Knob::GpuPowerLimit), 1);
        assert_eq!(attempts(Knob::GpuUsagePercent), 2);

        // no original recorded for the knob that never changed
        let saved = h.executor.originals().get(&1002).unwrap();
        assert!(!saved.contains_key(&Knob::GpuPowerLimit));
    }

    #[tokio::test]
    async fn out_of_range_thread_counts_never_reach_the_backend() {
        let mut h = harness(false).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;

        for bad in [0i64, -3, 64] {
            h.executor
                .execute(AdjustmentTask::FunctionCall {
                    pid: 1001,
                    process_name: "cpu_miner".into(),
                    knob: Knob::CpuThreads,
                    value: KnobValue::Int(bad),
                })
                .await;
        }
        assert!(h.backend.applied().is_empty());
        assert!(h.executor.originals().is_empty());
    }

    #[tokio::test]
    async fn gpu_knobs_dropped_for_non_gpu_process_others_apply() {
        let mut h = harness(true).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;

        let action = ActionVector([4.0, 2048.0, 60.0, 70.0, 40.0, 30.0, 25.0]);
        h.executor
            .execute(AdjustmentTask::Optimization { pid: 1001, action })
            .await;
        while let Some((_, task)) = h.executor.queue.pop() {
            h.executor.execute(task).await;
        }

        let knobs = h.backend.applied_knobs();
        assert!(!knobs.contains(&Knob::GpuUsagePercent));
        assert!(knobs.contains(&Knob::CpuThreads));
        assert!(knobs.contains(&Knob::NetworkBandwidthLimitMbps));
    }

    #[tokio::test]
    async fn unknown_strategy_surfaces_to_caller() {
        let mut h = harness(false).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;
        let err = h
            .executor
            .apply_cloak_strategy("thermal", 1001)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StrategyUnknown(_)));
    }

    #[tokio::test]
    async fn failed_preread_records_unknown_and_restore_skips_it() {
        let mut h = harness(false).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;
        h.backend.fail_reads_with(
            Knob::CpuFreq,
            Error::SensorUnavailable("no cpufreq sysfs".into()),
        );

        h.executor.apply_cloak_strategy("cpu", 1001).await.unwrap();
        let saved = h.executor.originals().get(&1001).unwrap();
        assert_eq!(saved.get(&Knob::CpuFreq), Some(&SavedLimit::Unknown));
        // the write still went ahead
        assert!(h.backend.applied_knobs().contains(&Knob::CpuFreq));

        h.executor.restore_resources(1001).await.unwrap();
        assert!(h.executor.originals().get(&1001).is_none());
        // no restore write for the unknown knob: only the initial cloak write
        let freq_writes = h
            .backend
            .applied_knobs()
            .iter()
            .filter(|k| **k == Knob::CpuFreq)
            .count();
        assert_eq!(freq_writes, 1);
    }

    #[tokio::test]
    async fn partial_restore_failure_keeps_only_failed_entries() {
        let mut h = harness(false).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;

        h.executor.apply_cloak_strategy("cpu", 1001).await.unwrap();
        assert_eq!(h.executor.originals().get(&1001).unwrap().len(), 3);

        h.backend
            .fail_applies_with(Knob::CpuFreq, Error::AdapterTransient("cpupower flaked".into()));
        let err = h.executor.restore_resources(1001).await.unwrap_err();
        assert!(matches!(err, Error::AdapterTransient(_)));
        let saved = h.executor.originals().get(&1001).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved.contains_key(&Knob::CpuFreq));

        // retry completes once the tool recovers
        h.backend.clear_failures();
        h.executor.restore_resources(1001).await.unwrap();
        assert!(h.executor.originals().get(&1001).is_none());
    }

    #[tokio::test]
    async fn vanished_process_drops_saved_limits_without_restore() {
        let mut h = harness(false).await;
        // never staged in the registry: pid is unknown
        h.executor
            .execute(AdjustmentTask::FunctionCall {
                pid: 4242,
                process_name: "cpu_miner".into(),
                knob: Knob::CpuFreq,
                value: KnobValue::Int(2000),
            })
            .await;
        assert!(h.backend.applied().is_empty());
        assert!(h.executor.originals().is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_forces_restore() {
        let h = harness(false).await;
        stage(&h.registry, 1001, "cpu_miner", false).await;
        stage(&h.registry, 1003, "cpu_miner_b", false).await;

        let tx = h.tx.clone();
        tx.send(Submission::new(
            PRIORITY_MONITOR,
            AdjustmentTask::Monitoring {
                pid: 1001,
                flags: CloakFlags {
                    cpu: true,
                    ..Default::default()
                },
            },
        ))
        .unwrap();
        tx.send(Submission::new(
            PRIORITY_MONITOR,
            AdjustmentTask::Monitoring {
                pid: 1003,
                flags: CloakFlags {
                    cpu: true,
                    ..Default::default()
                },
            },
        ))
        .unwrap();

        let backend = h.backend.clone();
        let stop = h.stop.clone();
        let handle = tokio::spawn(h.executor.run());

        // wait until both cloaks have landed
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let pids: HashSet<u32> =
                    backend.applied().iter().map(|(pid, _, _)| *pid).collect();
                if pids.contains(&1001) && pids.contains(&1003) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cloaks applied");

        stop.trigger();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("executor stops")
            .expect("no panic");
        assert_eq!(report.restore_failures, 0);
        assert!(report.residual_pids.is_empty());
        assert!(!h.registry.get(1001).await.unwrap().is_cloaked);
        assert!(!h.registry.get(1003).await.unwrap().is_cloaked);
    }
}
