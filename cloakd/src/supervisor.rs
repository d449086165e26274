//! Lifecycle supervisor: constructs the engine once, wires the four
//! workers together, owns the shutdown signal, and tears everything down
//! in order at exit.

use crate::adapters::OsAdapters;
use crate::config::Config;
use crate::error::Error;
use crate::executor::{Executor, ExecutorReport};
use crate::gpu::GpuManager;
use crate::model::{ActionLimits, ActionModel};
use crate::monitor::{LogTelemetrySink, Monitor, TelemetrySink};
use crate::optimizer::Optimizer;
use crate::power::NodeEnvelope;
use crate::queue::{AdjustmentTask, Submission, PRIORITY_MONITOR};
use crate::registry::ProcessRegistry;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Shared stop flag plus wakeup. Cloned into every worker; any clone can
/// trigger it, and triggering is idempotent.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal is (or already was) triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A collaborator-issued cloak request: apply these strategies, in order,
/// to this process.
#[derive(Debug, Clone)]
pub struct CloakRequest {
    pub pid: u32,
    pub strategies: Vec<String>,
}

static CONSTRUCTED: OnceCell<()> = OnceCell::new();

pub struct Supervisor {
    cfg: Arc<Config>,
    registry: Arc<ProcessRegistry>,
    gpu: Arc<GpuManager>,
    envelope: Arc<RwLock<NodeEnvelope>>,
    model: Arc<ActionModel>,
    telemetry: Arc<dyn TelemetrySink>,
    stop: ShutdownSignal,
    task_tx: mpsc::UnboundedSender<Submission>,
    cloak_tx: mpsc::UnboundedSender<CloakRequest>,
    cloak_rx: mpsc::UnboundedReceiver<CloakRequest>,
    executor: Executor,
}

impl Supervisor {
    /// Construct the engine. Process-wide: the first call wins, any later
    /// call is a logged no-op returning `None`.
    pub fn bootstrap(cfg: Config) -> Result<Option<Self>, Error> {
        if CONSTRUCTED.set(()).is_err() {
            warn!("supervisor already constructed; ignoring re-entrant initialization");
            return Ok(None);
        }
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let gpu = Arc::new(GpuManager::new());
        let registry = Arc::new(ProcessRegistry::new());
        let limits = ActionLimits::from_config(&cfg, registry.logical_cores());
        let model = Arc::new(ActionModel::load(&cfg.model_path, limits)?);

        let stop = ShutdownSignal::new();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (cloak_tx, cloak_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(OsAdapters::new(
            gpu.clone(),
            registry.logical_cores(),
            cfg.resource_allocation.ram.max_allocation_mb,
            cfg.resource_allocation.disk_io.max_limit_mbps,
        ));
        let executor = Executor::new(
            backend,
            registry.clone(),
            cfg.clone(),
            task_rx,
            stop.clone(),
            gpu.available(),
            registry.logical_cores(),
        );
        info!(
            cores = registry.logical_cores(),
            gpu = gpu.available(),
            "supervisor constructed"
        );
        Ok(Some(Self {
            cfg,
            registry,
            gpu,
            envelope: Arc::new(RwLock::new(NodeEnvelope::default())),
            model,
            telemetry: Arc::new(LogTelemetrySink),
            stop,
            task_tx,
            cloak_tx,
            cloak_rx,
            executor,
        }))
    }

    /// Handle used by signal handlers (and tests) to request shutdown.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.stop.clone()
    }

    /// Producer handle collaborators use to request cloaks.
    // Suppress dead_code until the anomaly-detector collaborator is wired in.
    #[allow(dead_code)]
    pub fn cloak_request_sender(&self) -> mpsc::UnboundedSender<CloakRequest> {
        self.cloak_tx.clone()
    }

    /// Run to completion. Returns the process exit code: 0 for a clean
    /// stop, 2 when a worker died or the final restore failed.
    pub async fn run(self) -> i32 {
        let Self {
            cfg,
            registry,
            gpu,
            envelope,
            model,
            telemetry,
            stop,
            task_tx,
            cloak_tx,
            cloak_rx,
            executor,
        } = self;

        let monitor = Monitor::new(
            cfg.clone(),
            registry.clone(),
            gpu.clone(),
            envelope.clone(),
            task_tx.clone(),
            telemetry,
            stop.clone(),
        );
        let optimizer = Optimizer::new(
            cfg.clone(),
            registry.clone(),
            model,
            task_tx.clone(),
            stop.clone(),
        );
        let monitor_handle = tokio::spawn(monitor.run());
        let optimizer_handle = tokio::spawn(optimizer.run());
        let intake_handle = tokio::spawn(intake_loop(cloak_rx, task_tx.clone(), stop.clone()));
        let mut executor_handle = tokio::spawn(executor.run());
        info!("all workers running");

        let mut code = 0;
        let mut early_exit: Option<Result<ExecutorReport, JoinError>> = None;
        tokio::select! {
            _ = stop.wait() => info!("shutdown requested"),
            res = &mut executor_handle => {
                error!("adjustment executor exited before shutdown");
                code = 2;
                early_exit = Some(res);
            }
        }
        stop.trigger();
        drop(task_tx);
        drop(cloak_tx);

        for (name, handle) in [
            ("monitor", monitor_handle),
            ("optimizer", optimizer_handle),
            ("cloak-intake", intake_handle),
        ] {
            if let Err(e) = handle.await {
                error!(worker = name, "task failed: {e}");
                code = 2;
            }
        }

        let executor_result = match early_exit {
            Some(res) => res,
            None => executor_handle.await,
        };
        match executor_result {
            Ok(report) => {
                if report.restore_failures > 0 || !report.residual_pids.is_empty() {
                    warn!(
                        failures = report.restore_failures,
                        residual_pids = ?report.residual_pids,
                        "restore incomplete at shutdown"
                    );
                } else {
                    info!(executed = report.tasks_executed, "all adjustments released");
                }
            }
            Err(e) => {
                error!("executor task failed: {e}");
                code = 2;
            }
        }

        gpu.shutdown();
        info!(code, "supervisor stopped");
        code
    }
}

/// Fourth worker: forwards collaborator cloak requests into the main
/// queue at monitoring priority.
async fn intake_loop(
    mut rx: mpsc::UnboundedReceiver<CloakRequest>,
    tx: mpsc::UnboundedSender<Submission>,
    stop: ShutdownSignal,
) {
    info!("cloak request intake started");
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            req = rx.recv() => match req {
                Some(req) => {
                    debug!(pid = req.pid, strategies = ?req.strategies, "cloak request received");
                    let task = AdjustmentTask::Cloaking {
                        pid: req.pid,
                        strategies: req.strategies,
                    };
                    if tx.send(Submission::new(PRIORITY_MONITOR, task)).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    info!("cloak request intake stopped");
}
