//! Supervisor Engine: owns the program lifecycle, processes IPC
//! commands, and integrates the Signal Router and Reaper.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Uid};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::child::ChildExecutor;
use crate::error::{Error, Result};
use crate::ipc::{Msg, Pipe};
use crate::reaper::Reaper;
use crate::signals::{signal_from_name, HookFuture, Router, SignalConfig, SignalHook};

/// Immutable configuration for one supervisor instance.
pub struct Config {
    pub fifo_path: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub uid: Uid,
    pub gid: Gid,
    /// Signals to trap; complement is forwarded.
    pub traps: HashSet<Signal>,
    /// Trap hook command, already split on whitespace. A single token is
    /// invoked with the trapping signal's number as `$1`; more than one
    /// token is invoked verbatim with the remaining tokens as args. Empty
    /// (or a single empty-string token) means no hook.
    pub trap_args: Vec<String>,
    pub start_delay: Duration,
    pub stop_delay: Duration,
}

/// Owns the child-lifecycle state machine and multiplexes IPC and signal
/// events. At most one ChildHandle is RUNNING at any time.
pub struct Supervisor {
    config: Config,
    current: Mutex<ChildExecutor>,
    pipe: Pipe,
    reaper: Reaper,
    router: Router,
    shutdown: Arc<Notify>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self> {
        let pipe = Pipe::new(&config.fifo_path)?;
        let current = ChildExecutor::new(config.uid, config.gid);
        Ok(Supervisor {
            config,
            current: Mutex::new(current),
            pipe,
            reaper: Reaper::new(),
            router: Router::new(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Request the service loop to stop on its next iteration.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Refuses if the current handle has started and is neither finished
    /// nor signaled; else swaps in a fresh executor bound to the same
    /// identity, sleeps the start delay, and launches the child.
    pub async fn start(&self) {
        let fresh = {
            let mut guard = self.current.lock().await;
            let info = guard.info().await;
            if info.start_time != 0 && !info.finished && !info.signaled {
                warn!("start refused: child is already running");
                return;
            }
            let fresh = guard.copy();
            *guard = fresh.clone();
            fresh
        };

        tokio::time::sleep(self.config.start_delay).await;

        let started = fresh.start(self.config.program.clone(), self.config.args.clone());
        match started.await {
            Ok(true) => {
                let info = fresh.info().await;
                info!("child started, pid={}", info.pid);
            }
            _ => {
                let info = fresh.wait_exited().await;
                error!(
                    "child start failed: {}",
                    info.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    /// Refuses if the current handle is already finished or signaled.
    /// Sleeps the stop delay (letting a pre-down hook finish), terminates,
    /// then awaits full process exit.
    pub async fn stop(&self) {
        let exec = { self.current.lock().await.clone() };
        let info = exec.info().await;
        if info.finished || info.signaled {
            warn!("stop refused: child already finished or signaled");
            return;
        }

        tokio::time::sleep(self.config.stop_delay).await;
        if let Err(e) = exec.terminate().await {
            warn!("terminate failed: {e}");
        }
        exec.wait_exited().await;
    }

    /// Terminate the current child, wait for its natural exit, then start
    /// a fresh instance under the same command line.
    pub async fn cycle(&self) {
        let exec = { self.current.lock().await.clone() };
        if let Err(e) = exec.terminate().await {
            warn!("cycle: terminate failed: {e}");
        }
        exec.wait_exited().await;
        self.start().await;
    }

    /// Refuses unless the child is RUNNING. Sends `sig` to the child's
    /// process group.
    pub async fn signal(&self, sig: Signal) -> Result<()> {
        let exec = { self.current.lock().await.clone() };
        exec.send_signal(sig).await
    }

    async fn dispatch(&self, msg: Msg) {
        match msg.name.as_str() {
            "signal" => match msg.args.first().and_then(|n| signal_from_name(n)) {
                Some(sig) => {
                    if let Err(e) = self.signal(sig).await {
                        if !matches!(e, Error::ChildNotRunning) {
                            warn!("signal command failed: {e}");
                        }
                    }
                }
                None => warn!(
                    "ipc: invalid signal name in message: {:?}",
                    msg.args.first()
                ),
            },
            "up" => {
                self.start().await;
                if !msg.args.is_empty() {
                    run_hook_command(&msg.args).await;
                }
            }
            "down" => {
                if !msg.args.is_empty() {
                    run_hook_command(&msg.args).await;
                }
                self.stop().await;
            }
            "cycle" => self.cycle().await,
            other => warn!("ipc: unknown command: {other}"),
        }
    }

    async fn run_trap(&self, sig: Signal) {
        let trap_args = &self.config.trap_args;
        if trap_args.is_empty() || (trap_args.len() == 1 && trap_args[0].is_empty()) {
            return;
        }

        if trap_args.len() == 1 {
            run_hook(&trap_args[0], &[(sig as i32).to_string()]).await;
        } else {
            run_hook(&trap_args[0], &trap_args[1..]).await;
        }
    }

    /// Start the Reaper and Signal Router and open the IPC pipe's reader,
    /// without yet launching the supervised child. Callers should invoke
    /// this before the initial `start()` so that a signal arriving in the
    /// window right after launch is still trapped or forwarded correctly.
    pub fn start_services(self: &Arc<Self>) -> Result<mpsc::Receiver<Msg>> {
        self.reaper.start();

        let rx = self
            .pipe
            .open()
            .ok_or_else(|| Error::SetupFatal("ipc reader already started".into()))?;

        let trap_sup = self.clone();
        let trap_hook: SignalHook = Arc::new(move |sig: Signal| -> HookFuture {
            let sup = trap_sup.clone();
            Box::pin(async move { sup.run_trap(sig).await })
        });

        let forward_sup = self.clone();
        let forward_hook: SignalHook = Arc::new(move |sig: Signal| -> HookFuture {
            let sup = forward_sup.clone();
            Box::pin(async move {
                if sig == Signal::SIGCHLD {
                    return;
                }
                if let Err(e) = sup.signal(sig).await {
                    if !matches!(e, Error::ChildNotRunning) {
                        warn!("forwarding {sig:?} failed: {e}");
                    }
                }
            })
        });

        self.router.start(
            SignalConfig {
                traps: self.config.traps.clone(),
            },
            Some(trap_hook),
            Some(forward_hook),
        )?;

        Ok(rx)
    }

    /// Run the service loop: select over the next IPC message and an
    /// external shutdown request. On exit, stops the child (best effort),
    /// stops the Signal Router, and closes the IPC pipe.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<Msg>) -> Result<()> {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(m) => self.dispatch(m).await,
                        None => {
                            info!("ipc channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.stop().await;
        self.router.stop();
        self.pipe.close();
        Ok(())
    }

    /// Convenience wrapper for callers that don't need to launch the child
    /// between service startup and the service loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let rx = self.start_services()?;
        self.serve(rx).await
    }
}

async fn run_hook_command(args: &[String]) {
    if args.is_empty() {
        return;
    }
    run_hook(&args[0], &args[1..]).await;
}

async fn run_hook(program: &str, args: &[String]) {
    let status = tokio::process::Command::new(program).args(args).status().await;
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => warn!("hook command {program:?} exited with {s}"),
        Err(e) => warn!("failed to run hook command {program:?}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(fifo: PathBuf, program: &str, args: &[&str]) -> Config {
        Config {
            fifo_path: fifo,
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            uid: Uid::current(),
            gid: Gid::current(),
            traps: HashSet::new(),
            trap_args: Vec::new(),
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
        }
    }

    fn temp_fifo(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("drinit-sup-test-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn start_then_stop_reports_signaled_exit() {
        let fifo = temp_fifo("start-stop");
        let config = test_config(fifo, "/bin/sh", &["-c", "sleep 30"]);
        let sup = Supervisor::new(config).expect("construct supervisor");

        sup.start().await;
        let info_before = sup.current.lock().await.info().await;
        assert!(info_before.pid > 0);

        sup.stop().await;
        let info_after = sup.current.lock().await.info().await;
        assert!(info_after.signaled);
        assert!(!info_after.finished);

        sup.pipe.close();
    }

    #[tokio::test]
    async fn cycle_produces_a_new_pid() {
        let fifo = temp_fifo("cycle");
        let config = test_config(fifo, "/bin/sh", &["-c", "sleep 30"]);
        let sup = Supervisor::new(config).expect("construct supervisor");

        sup.start().await;
        let pid_before = sup.current.lock().await.info().await.pid;

        sup.cycle().await;
        let pid_after = sup.current.lock().await.info().await.pid;

        assert_ne!(pid_before, pid_after);
        assert!(pid_after > 0);

        sup.stop().await;
        sup.pipe.close();
    }

    #[tokio::test]
    async fn second_start_while_running_is_refused() {
        let fifo = temp_fifo("refuse-start");
        let config = test_config(fifo, "/bin/sh", &["-c", "sleep 30"]);
        let sup = Supervisor::new(config).expect("construct supervisor");

        sup.start().await;
        let pid_first = sup.current.lock().await.info().await.pid;

        sup.start().await;
        let pid_second = sup.current.lock().await.info().await.pid;

        assert_eq!(pid_first, pid_second);

        sup.stop().await;
        sup.pipe.close();
    }
}
