//! cloakd entrypoint: parses args, loads config and model, constructs the
//! supervisor, and runs it until an interrupt or terminate signal.

mod adapters;
mod config;
mod error;
mod executor;
mod gpu;
mod model;
mod monitor;
mod optimizer;
mod power;
mod process;
mod queue;
mod registry;
mod strategy;
mod supervisor;

use anyhow::Context;
use config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub(crate) struct ParsedArgs {
    config: Option<PathBuf>,
    model: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    version: bool,
    help: bool,
}

fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} --config CONFIG_JSON [--model MODEL_JSON] [--log-dir DIR] [--version]\n"
    )
}

pub(crate) fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "cloakd".into());
    let mut config: Option<PathBuf> = None;
    let mut model: Option<PathBuf> = None;
    let mut log_dir: Option<PathBuf> = None;
    let mut version = false;
    let mut help = false;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                help = true;
            }
            "--config" | "-c" => {
                config = it.next().map(PathBuf::from);
            }
            "--model" | "-m" => {
                model = it.next().map(PathBuf::from);
            }
            "--log-dir" => {
                log_dir = it.next().map(PathBuf::from);
            }
            "--version" | "-V" => {
                version = true;
            }
            _ if arg.starts_with("--config=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        config = Some(PathBuf::from(v));
                    }
                }
            }
            _ if arg.starts_with("--model=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        model = Some(PathBuf::from(v));
                    }
                }
            }
            _ if arg.starts_with("--log-dir=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        log_dir = Some(PathBuf::from(v));
                    }
                }
            }
            other => {
                return Err(format!("Unknown argument: {other}\n{}", usage(&prog)));
            }
        }
    }
    Ok(ParsedArgs {
        config,
        model,
        log_dir,
        version,
        help,
    })
}

/// Stderr by default; an append-mode file under --log-dir when given.
/// Rotation and encryption belong to the external log collaborator.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            let path = dir.join("cloakd.log");
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Trip the shutdown signal on SIGINT or SIGTERM.
fn spawn_signal_listener(stop: supervisor::ShutdownSignal) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                stop.trigger();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = terminate.recv() => info!("terminate received"),
        }
        stop.trigger();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args()) {
        Ok(a) => a,
        Err(msg) => {
            eprint!("{msg}");
            return ExitCode::from(1);
        }
    };
    if args.help {
        print!("{}", usage("cloakd"));
        return ExitCode::SUCCESS;
    }
    if args.version {
        println!("cloakd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_tracing(args.log_dir.as_deref()) {
        eprintln!("cloakd: cannot initialize logging: {e:#}");
        return ExitCode::from(1);
    }

    let Some(config_path) = args.config else {
        eprintln!("cloakd: --config is required (see --help)");
        return ExitCode::from(1);
    };
    let cfg = match Config::load(&config_path) {
        Ok(mut cfg) => {
            if let Some(model) = args.model {
                cfg.model_path = model;
            }
            cfg
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let supervisor = match Supervisor::bootstrap(cfg) {
        Ok(Some(s)) => s,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };
    spawn_signal_listener(supervisor.shutdown_handle());

    let code = supervisor.run().await;
    ExitCode::from(code as u8)
}
