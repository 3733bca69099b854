//! drinit - minimal PID 1 process supervisor.
//!
//! Launches a single supervised program, forwards signals to it via its
//! process group, reaps orphaned descendants, and accepts start/stop/
//! cycle/signal commands over a control FIFO.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use nix::unistd::{Gid, Uid};

use drinit::signals::signal_from_name;
use drinit::supervisor::{Config, Supervisor};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_FIFO: &str = "/tmp/drinit.pipe";

/// Minimal PID 1 process supervisor.
#[derive(Parser)]
#[command(name = "drinit")]
#[command(version = VERSION)]
#[command(about = "Supervises a single child process as PID 1")]
struct Args {
    /// Path to the control FIFO.
    #[arg(short = 'f', long = "fd", default_value = DEFAULT_FIFO)]
    fd: PathBuf,

    /// Trap command, space-split at launch. A single token receives the
    /// trapping signal's number as `$1`; otherwise the remaining tokens
    /// are passed verbatim.
    #[arg(short = 'r', long = "run", default_value = "")]
    run: String,

    /// Comma-separated signal names to trap; complement is forwarded.
    #[arg(short = 't', long = "traps", default_value = "")]
    traps: String,

    /// Verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// The supervised program and its arguments (everything after `--`).
    #[arg(required = true, trailing_var_arg = true)]
    program: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    info!("drinit v{VERSION} starting");

    let (program, program_args) = args
        .program
        .split_first()
        .map(|(p, rest)| (p.clone(), rest.to_vec()))
        .context("a supervised program is required")?;

    let trap_args: Vec<String> = args.run.split_whitespace().map(String::from).collect();

    let mut traps = HashSet::new();
    for name in args.traps.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match signal_from_name(name) {
            Some(sig) => {
                traps.insert(sig);
            }
            None => error!("unknown trap signal name {name:?}, ignoring"),
        }
    }

    info!("Phase 1: preparing control channel at {}", args.fd.display());
    let config = Config {
        fifo_path: args.fd,
        program,
        args: program_args,
        uid: Uid::current(),
        gid: Gid::current(),
        traps,
        trap_args,
        start_delay: Duration::ZERO,
        stop_delay: Duration::ZERO,
    };

    info!("Phase 2: building supervisor engine");
    let supervisor = match Supervisor::new(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("fatal setup error: {e}");
            std::process::exit(1);
        }
    };

    info!("Phase 3: starting reaper and signal router");
    let rx = match supervisor.start_services() {
        Ok(rx) => rx,
        Err(e) => {
            error!("fatal setup error: {e}");
            std::process::exit(1);
        }
    };

    info!("Phase 4: starting supervised child");
    supervisor.start().await;

    info!("drinit ready, entering service loop");
    if let Err(e) = supervisor.serve(rx).await {
        error!("service loop exited with error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
