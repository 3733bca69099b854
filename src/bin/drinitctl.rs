//! drinitctl - control client for a running drinit supervisor.
//!
//! Emits exactly one IPC message to the supervisor's FIFO and exits.

use std::path::PathBuf;

use clap::Parser;

use drinit::ipc::{send, Msg};
use drinit::signals::signal_from_name;

const DEFAULT_FIFO: &str = "/tmp/drinit.pipe";

/// Control client for a running drinit supervisor.
#[derive(Parser)]
#[command(name = "drinitctl")]
struct Args {
    /// Path to the control FIFO.
    #[arg(short = 'f', long = "fd", default_value = DEFAULT_FIFO)]
    fd: PathBuf,

    /// Numeric command: 1 = cycle, 2 = up, 3 = down.
    #[arg(short = 'c', long = "command")]
    command: Option<u8>,

    /// Send a `signal` message with this canonical signal name.
    #[arg(short = 's', long = "signal")]
    signal: Option<String>,

    /// Hook command to attach as message args for up/down.
    #[arg(short = 'r', long = "run")]
    run: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let name = if let Some(sig_name) = &args.signal {
        if signal_from_name(sig_name).is_none() {
            eprintln!("unknown signal name: {sig_name}");
            std::process::exit(1);
        }
        "signal"
    } else {
        match args.command {
            Some(1) => "cycle",
            Some(2) => "up",
            Some(3) => "down",
            Some(other) => {
                eprintln!("invalid command: {other}");
                std::process::exit(1);
            }
            None => {
                eprintln!("one of --command or --signal is required");
                std::process::exit(1);
            }
        }
    };

    let mut msg_args = Vec::new();
    if let Some(sig_name) = &args.signal {
        msg_args.push(sig_name.clone());
    } else if let Some(run) = &args.run {
        msg_args.extend(run.split_whitespace().map(String::from));
    }

    let msg = Msg {
        epoch: 0,
        name: name.to_string(),
        args: msg_args,
    };

    if let Err(e) = send(&args.fd, msg).await {
        eprintln!("failed to send command: {e}");
        std::process::exit(1);
    }
}
