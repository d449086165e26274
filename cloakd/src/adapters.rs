//! OS adapter layer. Each knob maps to one small operation over an
//! external tool, a sysfs file, or the GPU SDK. Adapters never retry;
//! they return a typed error and let the executor decide.

use crate::error::Error;
use crate::gpu::GpuManager;
use crate::process::ProcessView;
use crate::queue::{Knob, KnobValue};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Hard ceiling on any external tool invocation.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

const DROP_CACHES_PATH: &str = "/proc/sys/vm/drop_caches";
const CPUFREQ_MAX_PATH: &str = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_max_freq";

/// The seam between the executor and the host. The executor is the only
/// caller; tests substitute a recording implementation.
#[async_trait]
pub trait KnobBackend: Send + Sync {
    /// Write a knob. Total: every failure is a typed `Error`.
    async fn apply(&self, target: &ProcessView, knob: Knob, value: &KnobValue)
        -> Result<(), Error>;

    /// Read the current value of a knob, used to snapshot originals before
    /// the first write.
    async fn read(&self, target: &ProcessView, knob: Knob) -> Result<KnobValue, Error>;
}

pub struct OsAdapters {
    gpu: Arc<GpuManager>,
    logical_cores: usize,
    /// Nominal caps reported for the log-only knobs.
    ram_cap_mb: u64,
    disk_cap_mbps: f64,
    tool_timeout: Duration,
}

impl OsAdapters {
    pub fn new(gpu: Arc<GpuManager>, logical_cores: usize, ram_cap_mb: u64, disk_cap_mbps: f64) -> Self {
        Self {
            gpu,
            logical_cores,
            ram_cap_mb,
            disk_cap_mbps,
            tool_timeout: TOOL_TIMEOUT,
        }
    }

    async fn run_tool(&self, program: &str, args: &[String]) -> Result<String, Error> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let out = match timeout(self.tool_timeout, cmd.output()).await {
            Err(_) => {
                return Err(Error::AdapterTransient(format!(
                    "{program} timed out after {:?}",
                    self.tool_timeout
                )))
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::AdapterPermanent(format!("{program} not found on host")))
            }
            Ok(Err(e)) => return Err(Error::AdapterTransient(format!("{program}: {e}"))),
            Ok(Ok(out)) => out,
        };
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(Error::AdapterTransient(format!(
                "{program} {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    fn ensure_alive(&self, pid: u32) -> Result<(), Error> {
        if Path::new(&format!("/proc/{pid}")).exists() {
            Ok(())
        } else {
            Err(Error::ProcessGone(pid))
        }
    }

    /// Pin the process to cores 0..n-1.
    async fn set_cpu_threads(&self, pid: u32, threads: i64, name: &str) -> Result<(), Error> {
        if threads <= 0 || threads as usize > self.logical_cores {
            return Err(Error::AdapterTransient(format!(
                "requested {threads} cpu threads outside 1..={}",
                self.logical_cores
            )));
        }
        self.ensure_alive(pid)?;
        let cores = if threads == 1 {
            "0".to_string()
        } else {
            format!("0-{}", threads - 1)
        };
        self.run_tool("taskset", &["-cp".into(), cores, pid.to_string()])
            .await?;
        info!(pid, process = name, threads, "pinned cpu threads");
        Ok(())
    }

    async fn read_cpu_threads(&self, pid: u32) -> Result<KnobValue, Error> {
        self.ensure_alive(pid)?;
        let out = self.run_tool("taskset", &["-cp".into(), pid.to_string()]).await?;
        parse_affinity_count(&out)
            .map(|n| KnobValue::Int(n as i64))
            .ok_or_else(|| Error::SensorUnavailable(format!("unparseable taskset output for {pid}")))
    }

    /// Best-effort frequency cap through cpupower; reads go via sysfs.
    async fn set_cpu_freq(&self, mhz: i64) -> Result<(), Error> {
        if mhz <= 0 {
            return Err(Error::AdapterTransient(format!(
                "refusing non-positive cpu frequency {mhz} MHz"
            )));
        }
        self.run_tool(
            "cpupower",
            &["frequency-set".into(), "-u".into(), format!("{mhz}MHz")],
        )
        .await?;
        info!(mhz, "capped cpu frequency");
        Ok(())
    }

    fn read_cpu_freq(&self) -> Result<KnobValue, Error> {
        let raw = std::fs::read_to_string(CPUFREQ_MAX_PATH)
            .map_err(|e| Error::SensorUnavailable(format!("{CPUFREQ_MAX_PATH}: {e}")))?;
        let khz: u64 = raw
            .trim()
            .parse()
            .map_err(|_| Error::SensorUnavailable("non-numeric scaling_max_freq".into()))?;
        Ok(KnobValue::Int((khz / 1000) as i64))
    }

    async fn set_nice(&self, pid: u32, nice: i64, name: &str) -> Result<(), Error> {
        self.ensure_alive(pid)?;
        self.run_tool(
            "renice",
            &["-n".into(), nice.to_string(), "-p".into(), pid.to_string()],
        )
        .await?;
        info!(pid, process = name, nice, "set scheduler priority");
        Ok(())
    }

    fn read_nice(&self, pid: u32) -> Result<KnobValue, Error> {
        let raw = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map_err(|_| Error::ProcessGone(pid))?;
        parse_stat_nice(&raw)
            .map(KnobValue::Int)
            .ok_or_else(|| Error::SensorUnavailable(format!("unparseable /proc/{pid}/stat")))
    }

    async fn set_ionice(&self, pid: u32, class: i64, name: &str) -> Result<(), Error> {
        if !(0..=3).contains(&class) {
            return Err(Error::AdapterTransient(format!(
                "ionice class {class} outside 0..=3"
            )));
        }
        self.ensure_alive(pid)?;
        self.run_tool(
            "ionice",
            &["-c".into(), class.to_string(), "-p".into(), pid.to_string()],
        )
        .await?;
        info!(pid, process = name, class, "set io priority class");
        Ok(())
    }

    async fn read_ionice(&self, pid: u32) -> Result<KnobValue, Error> {
        self.ensure_alive(pid)?;
        let out = self.run_tool("ionice", &["-p".into(), pid.to_string()]).await?;
        parse_ionice_class(&out)
            .map(KnobValue::Int)
            .ok_or_else(|| Error::SensorUnavailable(format!("unparseable ionice output for {pid}")))
    }

    /// Token-bucket shaping on the process's interface. A non-positive rate
    /// removes the qdisc instead.
    async fn shape_network(&self, iface: &str, mbps: f64) -> Result<(), Error> {
        if mbps <= 0.0 {
            return self.clear_qdisc(iface).await;
        }
        // A leftover qdisc makes `add` fail with EEXIST; clear it first.
        if let Err(e) = self.clear_qdisc(iface).await {
            debug!(iface, "no qdisc to clear before add: {e}");
        }
        self.run_tool(
            "tc",
            &[
                "qdisc".into(),
                "add".into(),
                "dev".into(),
                iface.into(),
                "root".into(),
                "tbf".into(),
                "rate".into(),
                format!("{mbps}mbit"),
                "burst".into(),
                "32kbit".into(),
                "latency".into(),
                "400ms".into(),
            ],
        )
        .await?;
        info!(iface, mbps, "applied bandwidth cap");
        Ok(())
    }

    async fn clear_qdisc(&self, iface: &str) -> Result<(), Error> {
        self.run_tool(
            "tc",
            &[
                "qdisc".into(),
                "del".into(),
                "dev".into(),
                iface.into(),
                "root".into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn read_network_limit(&self, iface: &str) -> Result<KnobValue, Error> {
        let out = self
            .run_tool(
                "tc",
                &["qdisc".into(), "show".into(), "dev".into(), iface.into()],
            )
            .await?;
        // No tbf qdisc installed reads as an unshaped interface.
        Ok(KnobValue::Float(parse_tc_rate_mbit(&out).unwrap_or(0.0)))
    }

    fn drop_caches(&self) -> Result<(), Error> {
        match std::fs::write(DROP_CACHES_PATH, "3\n") {
            Ok(()) => {
                info!("dropped page cache");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(Error::AdapterPermanent(
                format!("{DROP_CACHES_PATH} not writable: {e}"),
            )),
            Err(e) => Err(Error::AdapterTransient(format!("{DROP_CACHES_PATH}: {e}"))),
        }
    }

    fn expect_int(value: &KnobValue, knob: Knob) -> Result<i64, Error> {
        value.as_i64().ok_or_else(|| {
            Error::AdapterTransient(format!("{knob} expects a numeric value, got {value:?}"))
        })
    }
}

#[async_trait]
impl KnobBackend for OsAdapters {
    async fn apply(&self, target: &ProcessView, knob: Knob, value: &KnobValue)
        -> Result<(), Error> {
        match knob {
            Knob::CpuThreads => {
                let threads = Self::expect_int(value, knob)?;
                self.set_cpu_threads(target.pid, threads, &target.name).await
            }
            Knob::CpuFreq => self.set_cpu_freq(Self::expect_int(value, knob)?).await,
            Knob::CpuNice => {
                let nice = Self::expect_int(value, knob)?;
                self.set_nice(target.pid, nice, &target.name).await
            }
            Knob::RamAllocationMb => {
                // No cgroup manager on this host; the cap is recorded and
                // logged only.
                warn!(
                    pid = target.pid,
                    process = %target.name,
                    cap_mb = %value,
                    "ram cap has no cgroup backing; logging only"
                );
                Ok(())
            }
            Knob::GpuPowerLimit => self.gpu.set_power_limit_w(Self::expect_int(value, knob)?),
            Knob::GpuUsagePercent => match value {
                KnobValue::Percents(percents) => self.gpu.set_usage_percents(percents),
                other => Err(Error::AdapterTransient(format!(
                    "gpu_usage_percent expects a percent vector, got {other:?}"
                ))),
            },
            Knob::IoniceClass => {
                let class = Self::expect_int(value, knob)?;
                self.set_ionice(target.pid, class, &target.name).await
            }
            Knob::DiskIoLimitMbps => {
                warn!(
                    pid = target.pid,
                    process = %target.name,
                    limit_mbps = %value,
                    "disk io cap has no cgroup backing; logging only"
                );
                Ok(())
            }
            Knob::NetworkBandwidthLimitMbps => {
                let mbps = value.as_f64().ok_or_else(|| {
                    Error::AdapterTransient("bandwidth limit expects a number".into())
                })?;
                self.shape_network(&target.network_interface, mbps).await
            }
            Knob::DropCaches => self.drop_caches(),
        }
    }

    async fn read(&self, target: &ProcessView, knob: Knob) -> Result<KnobValue, Error> {
        match knob {
            Knob::CpuThreads => self.read_cpu_threads(target.pid).await,
            Knob::CpuFreq => self.read_cpu_freq(),
            Knob::CpuNice => self.read_nice(target.pid),
            Knob::RamAllocationMb => Ok(KnobValue::Int(self.ram_cap_mb as i64)),
            Knob::GpuPowerLimit => self.gpu.power_limit_w().map(KnobValue::Int),
            Knob::GpuUsagePercent => self.gpu.usage_percents().map(KnobValue::Percents),
            Knob::IoniceClass => self.read_ionice(target.pid).await,
            Knob::DiskIoLimitMbps => Ok(KnobValue::Float(self.disk_cap_mbps)),
            Knob::NetworkBandwidthLimitMbps => {
                self.read_network_limit(&target.network_interface).await
            }
            Knob::DropCaches => Err(Error::SensorUnavailable(
                "drop_caches has no readable state".into(),
            )),
        }
    }
}

/// Count cores in taskset output: "pid 42's current affinity list: 0-3,6".
pub fn parse_affinity_count(out: &str) -> Option<usize> {
    let list = out.rsplit(':').next()?.trim();
    if list.is_empty() {
        return None;
    }
    let mut count = 0usize;
    for part in list.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo.trim().parse().ok()?;
            let hi: usize = hi.trim().parse().ok()?;
            if hi < lo {
                return None;
            }
            count += hi - lo + 1;
        } else {
            let _: usize = part.parse().ok()?;
            count += 1;
        }
    }
    Some(count)
}

/// Map ionice output ("best-effort: prio 4", "idle", "none: prio 0",
/// "realtime: prio 2") to its class number.
pub fn parse_ionice_class(out: &str) -> Option<i64> {
    let head = out.trim().split(':').next()?.trim();
    match head {
        "none" => Some(0),
        "realtime" => Some(1),
        "best-effort" => Some(2),
        "idle" => Some(3),
        _ => None,
    }
}

/// Extract the tbf rate from `tc qdisc show` output, in Mbit/s.
pub fn parse_tc_rate_mbit(out: &str) -> Option<f64> {
    if !out.contains(" tbf ") && !out.starts_with("qdisc tbf") {
        return None;
    }
    let mut tokens = out.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "rate" {
            let value = tokens.next()?;
            return parse_rate_token(value);
        }
    }
    None
}

fn parse_rate_token(token: &str) -> Option<f64> {
    let lower = token.to_ascii_lowercase();
    let (scale, suffix) = if lower.ends_with("gbit") {
        (1000.0, "gbit")
    } else if lower.ends_with("mbit") {
        (1.0, "mbit")
    } else if lower.ends_with("kbit") {
        (0.001, "kbit")
    } else if lower.ends_with("bit") {
        (0.000_001, "bit")
    } else {
        return None;
    };
    lower
        .strip_suffix(suffix)?
        .parse::<f64>()
        .ok()
        .map(|v| v * scale)
}

/// Nice value from /proc/<pid>/stat: field 19, counting from the
/// right parenthesis that closes the comm field.
pub fn parse_stat_nice(stat: &str) -> Option<i64> {
    let rpar = stat.rfind(')')?;
    let after = stat.get(rpar + 2..)?;
    // "state" is field 3; nice is field 19, offset 16 from state.
    after.split_whitespace().nth(16)?.parse().ok()
}
