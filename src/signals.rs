//! Signal Router: converts the OS signal stream into two routed
//! callbacks, trap (run a local hook) and forward (relay to the child's
//! process group).

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use nix::sys::signal::{SigHandler, Signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// The full canonical signal-name table from the external wire format.
pub const SIGNAL_NAMES: &[(&str, Signal)] = &[
    ("SIGHUP", Signal::SIGHUP),
    ("SIGINT", Signal::SIGINT),
    ("SIGQUIT", Signal::SIGQUIT),
    ("SIGILL", Signal::SIGILL),
    ("SIGTRAP", Signal::SIGTRAP),
    ("SIGABRT", Signal::SIGABRT),
    ("SIGBUS", Signal::SIGBUS),
    ("SIGFPE", Signal::SIGFPE),
    ("SIGKILL", Signal::SIGKILL),
    ("SIGUSR1", Signal::SIGUSR1),
    ("SIGSEGV", Signal::SIGSEGV),
    ("SIGUSR2", Signal::SIGUSR2),
    ("SIGPIPE", Signal::SIGPIPE),
    ("SIGALRM", Signal::SIGALRM),
    ("SIGTERM", Signal::SIGTERM),
    ("SIGCHLD", Signal::SIGCHLD),
    ("SIGCONT", Signal::SIGCONT),
    ("SIGSTOP", Signal::SIGSTOP),
    ("SIGTSTP", Signal::SIGTSTP),
    ("SIGTTIN", Signal::SIGTTIN),
    ("SIGTTOU", Signal::SIGTTOU),
    ("SIGURG", Signal::SIGURG),
    ("SIGXCPU", Signal::SIGXCPU),
    ("SIGXFSZ", Signal::SIGXFSZ),
    ("SIGVTALRM", Signal::SIGVTALRM),
    ("SIGPROF", Signal::SIGPROF),
    ("SIGWINCH", Signal::SIGWINCH),
    ("SIGSYS", Signal::SIGSYS),
];

pub fn signal_from_name(name: &str) -> Option<Signal> {
    SIGNAL_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, s)| *s)
}

pub fn signal_name(sig: Signal) -> &'static str {
    SIGNAL_NAMES
        .iter()
        .find(|(_, s)| *s == sig)
        .map(|(n, _)| *n)
        .unwrap_or("UNKNOWN")
}

/// Signals that cannot be caught at all and so are never subscribed.
fn uncatchable(sig: Signal) -> bool {
    matches!(sig, Signal::SIGKILL | Signal::SIGSTOP)
}

/// Signal set to trap; implicit complement is forwarded.
#[derive(Clone, Default)]
pub struct SignalConfig {
    pub traps: HashSet<Signal>,
}

pub type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type SignalHook = Arc<dyn Fn(Signal) -> HookFuture + Send + Sync>;

pub struct Router {
    started: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    pub fn new() -> Self {
        Router {
            started: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to all deliverable signals and begin routing. Idempotent:
    /// a second call reports an error without panicking.
    pub fn start(
        &self,
        config: SignalConfig,
        trap_hook: Option<SignalHook>,
        forward_hook: Option<SignalHook>,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::SetupFatal("signal router already started".into()));
        }

        let mut traps = config.traps;
        if trap_hook.is_none() && !traps.is_empty() {
            warn!("signal router: no trap hook configured, treating traps as forward-only");
            traps.clear();
        }
        if forward_hook.is_none() {
            warn!("signal router: no forward hook configured, becoming trap-only");
        }

        // A runtime preemption signal must never be trapped; reset it to
        // default disposition explicitly rather than subscribing to it.
        unsafe {
            let _ = nix::sys::signal::signal(Signal::SIGURG, SigHandler::SigDfl);
        }

        let (tx, mut rx) = mpsc::channel::<Signal>(32);
        let mut tasks = Vec::new();

        for (_, sig) in SIGNAL_NAMES {
            let sig = *sig;
            if uncatchable(sig) || sig == Signal::SIGURG {
                continue;
            }
            let tx = tx.clone();
            let kind = tokio::signal::unix::SignalKind::from_raw(sig as i32);
            let mut stream = match tokio::signal::unix::signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("signal router: failed to subscribe to {sig:?}: {e}");
                    continue;
                }
            };
            let handle = tokio::spawn(async move {
                loop {
                    if stream.recv().await.is_none() {
                        break;
                    }
                    if tx.send(sig).await.is_err() {
                        break;
                    }
                }
            });
            tasks.push(handle);
        }
        drop(tx);

        let dispatch_handle = tokio::spawn(async move {
            while let Some(sig) = rx.recv().await {
                if traps.contains(&sig) {
                    if let Some(hook) = &trap_hook {
                        hook(sig).await;
                    }
                } else if let Some(hook) = &forward_hook {
                    hook(sig).await;
                }
            }
        });
        tasks.push(dispatch_handle);

        *self.tasks.lock().unwrap() = tasks;
        Ok(())
    }

    /// Cancel the subscriptions and end the routing task.
    pub fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
