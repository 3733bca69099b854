//! Reaper: absorbs exit notifications for any process whose parent is
//! this init, including descendants re-parented after their original
//! parent died. Without this, orphaned children become zombies under PID 1.
//!
//! Does not classify or attribute exits to the supervised child; the
//! Child Executor does that with its own synchronous wait on the child it
//! started. Both race for `waitpid`; whichever observes the exit first
//! wins, the other sees ECHILD.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub struct Reaper {
    started: Arc<AtomicBool>,
}

impl Reaper {
    pub fn new() -> Self {
        Reaper {
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the drain loop. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("reaper already started");
            return;
        }

        tokio::spawn(async move {
            let mut sigchld = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child())
            {
                Ok(s) => s,
                Err(e) => {
                    warn!("reaper: failed to subscribe to SIGCHLD: {e}");
                    return;
                }
            };

            // Drain once up front in case children exited before the reaper
            // was started.
            drain();

            loop {
                sigchld.recv().await;
                drain();
            }
        });
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every currently reapable child with a non-blocking wait loop.
/// Always waits on `-1` (every descendant), never the previously-returned
/// pid, so the loop actually drains the whole reapable set each pass.
fn drain() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_status) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!("reaper: unexpected waitpid error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_is_idempotent() {
        let reaper = Reaper::new();
        reaper.start();
        reaper.start();
        assert!(reaper.started.load(Ordering::SeqCst));
    }
}
