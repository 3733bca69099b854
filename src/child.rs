//! Child Executor: runs a single external command in its own process
//! group, observes its completion, and exposes termination.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};
use tokio::sync::{oneshot, watch, Mutex};

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninit,
    Running,
    Exited,
    Signaled,
}

/// A consistent snapshot of one ChildHandle.
#[derive(Debug, Clone)]
pub struct Info {
    pub pid: i32,
    pub exit_code: i32,
    pub error: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: Duration,
    pub finished: bool,
    pub signaled: bool,
    pub status: Status,
}

struct State {
    pid: i32,
    exit_code: i32,
    error: Option<String>,
    start_time: i64,
    end_time: i64,
    status: Status,
}

impl Default for State {
    fn default() -> Self {
        State {
            pid: 0,
            exit_code: -1,
            error: None,
            start_time: 0,
            end_time: 0,
            status: Status::Uninit,
        }
    }
}

struct Inner {
    uid: Uid,
    gid: Gid,
    started: AtomicBool,
    finished: AtomicBool,
    signaled: AtomicBool,
    state: Mutex<State>,
    exit_tx: watch::Sender<Option<Info>>,
}

/// One attempt to run the supervised program, bound to a fixed user identity.
///
/// Cheap to clone: clones share the same underlying record. `copy()`
/// produces an independent fresh handle bound to the same identity, used
/// when cycling.
#[derive(Clone)]
pub struct ChildExecutor(Arc<Inner>);

impl ChildExecutor {
    pub fn new(uid: Uid, gid: Gid) -> Self {
        let (exit_tx, _) = watch::channel(None);
        ChildExecutor(Arc::new(Inner {
            uid,
            gid,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            signaled: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            exit_tx,
        }))
    }

    /// A fresh handle bound to the same user identity.
    pub fn copy(&self) -> Self {
        Self::new(self.0.uid, self.0.gid)
    }

    /// Begin the child. Returns a one-shot boolean indicating whether
    /// fork/exec succeeded. Start is idempotent: a second call on the
    /// same handle is a no-op that reports failure.
    pub fn start(&self, program: String, args: Vec<String>) -> oneshot::Receiver<bool> {
        let (started_tx, started_rx) = oneshot::channel();

        if self.0.started.swap(true, Ordering::SeqCst) {
            let _ = started_tx.send(false);
            return started_rx;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let uid = this.0.uid.as_raw();
            let gid = this.0.gid.as_raw();

            let mut cmd = std::process::Command::new(&program);
            cmd.args(&args);
            cmd.uid(uid);
            cmd.gid(gid);
            if let Ok(pwd) = std::env::var("PWD") {
                if !pwd.is_empty() {
                    cmd.current_dir(pwd);
                }
            }
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
            unsafe {
                cmd.pre_exec(|| {
                    // pgid becomes the child's own pid, isolating it (and its
                    // descendants) from the init's process group without
                    // detaching from the controlling terminal.
                    nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    Ok(())
                });
            }

            match cmd.spawn() {
                Ok(child) => {
                    let pid = child.id() as i32;
                    let start_time = now_nanos();
                    {
                        let mut state = this.0.state.lock().await;
                        state.pid = pid;
                        state.start_time = start_time;
                        state.status = Status::Running;
                    }
                    let _ = started_tx.send(true);

                    let wait_result =
                        tokio::task::spawn_blocking(move || waitpid(Pid::from_raw(pid), None))
                            .await;
                    this.on_exit(wait_result).await;
                }
                Err(e) => {
                    let mut state = this.0.state.lock().await;
                    state.error = Some(format!("failed to spawn {program}: {e}"));
                    state.end_time = now_nanos();
                    let info = snapshot(&this.0, &state);
                    drop(state);
                    let _ = started_tx.send(false);
                    let _ = this.0.exit_tx.send(Some(info));
                }
            }
        });

        started_rx
    }

    /// Synchronous convenience: start then await the final info.
    pub async fn run(&self, program: String, args: Vec<String>) -> Info {
        let _ = self.start(program, args);
        self.wait_exited().await
    }

    async fn on_exit(
        &self,
        wait_result: std::result::Result<
            std::result::Result<WaitStatus, Errno>,
            tokio::task::JoinError,
        >,
    ) {
        let exit_code = match wait_result {
            Ok(Ok(WaitStatus::Exited(_, code))) => code,
            Ok(Ok(WaitStatus::Signaled(_, sig, _))) => sig as i32,
            Ok(Ok(other)) => {
                warn!("child wait returned unexpected status: {other:?}");
                255
            }
            Ok(Err(e)) => {
                warn!("waitpid failed: {e}");
                255
            }
            Err(e) => {
                warn!("wait task panicked: {e}");
                255
            }
        };

        let mut state = self.0.state.lock().await;
        state.end_time = now_nanos();
        state.exit_code = exit_code;
        if self.0.signaled.load(Ordering::SeqCst) {
            state.status = Status::Signaled;
        } else {
            self.0.finished.store(true, Ordering::SeqCst);
            state.status = Status::Exited;
        }
        let info = snapshot(&self.0, &state);
        drop(state);
        let _ = self.0.exit_tx.send(Some(info));
    }

    /// Send SIGTERM to the child's process group. A no-op if the child
    /// was never started or already finished. Sets `signaled` before
    /// issuing the kill so the wait-completion observer classifies the
    /// exit correctly regardless of race ordering.
    pub async fn terminate(&self) -> super::Result<()> {
        let pid = {
            let state = self.0.state.lock().await;
            if state.status != Status::Running {
                return Ok(());
            }
            state.pid
        };

        self.0.signaled.store(true, Ordering::SeqCst);
        match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send an arbitrary signal to the child's process group. Refuses
    /// unless the child is currently RUNNING.
    pub async fn send_signal(&self, sig: Signal) -> super::Result<()> {
        let pid = {
            let state = self.0.state.lock().await;
            if state.status != Status::Running {
                return Err(super::Error::ChildNotRunning);
            }
            state.pid
        };
        match killpg(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// A consistent snapshot of the current record.
    pub async fn info(&self) -> Info {
        let state = self.0.state.lock().await;
        snapshot(&self.0, &state)
    }

    /// Block until the child has fully exited, returning its final info.
    /// If the child was never started this never resolves; callers are
    /// expected to only call this after `start`/`terminate`.
    pub async fn wait_exited(&self) -> Info {
        let mut rx = self.0.exit_tx.subscribe();
        loop {
            if let Some(info) = rx.borrow().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                debug!("exit watch channel closed before a result arrived");
                return self.info().await;
            }
        }
    }
}

fn snapshot(inner: &Inner, state: &State) -> Info {
    let finished = inner.finished.load(Ordering::SeqCst);
    let signaled = inner.signaled.load(Ordering::SeqCst);
    let duration = if state.status == Status::Running && state.start_time != 0 {
        Duration::from_nanos((now_nanos() - state.start_time).max(0) as u64)
    } else {
        Duration::from_nanos(state.end_time.saturating_sub(state.start_time).max(0) as u64)
    };
    Info {
        pid: state.pid,
        exit_code: state.exit_code,
        error: state.error.clone(),
        start_time: state.start_time,
        end_time: state.end_time,
        duration,
        finished,
        signaled,
        status: state.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_identity() -> (Uid, Gid) {
        (Uid::current(), Gid::current())
    }

    #[tokio::test]
    async fn run_to_completion_reports_clean_exit() {
        let (uid, gid) = current_identity();
        let exec = ChildExecutor::new(uid, gid);
        let info = exec
            .run(
                "/bin/sh".to_string(),
                vec!["-c".to_string(), "echo ok; exit 0".to_string()],
            )
            .await;

        assert!(info.error.is_none());
        assert!(info.finished);
        assert!(!info.signaled);
        assert_eq!(info.exit_code, 0);
        assert!(info.start_time > 0);
    }

    #[tokio::test]
    async fn terminate_marks_signaled_with_term_exit_code() {
        let (uid, gid) = current_identity();
        let exec = ChildExecutor::new(uid, gid);
        let started = exec.start(
            "/bin/sh".to_string(),
            vec!["-c".to_string(), "sleep 30".to_string()],
        );
        assert!(started.await.unwrap_or(false));

        exec.terminate().await.expect("terminate should succeed");
        let info = exec.wait_exited().await;

        assert!(!info.finished);
        assert!(info.signaled);
        assert_eq!(info.exit_code, Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn terminate_before_start_is_a_no_op() {
        let (uid, gid) = current_identity();
        let exec = ChildExecutor::new(uid, gid);
        assert!(exec.terminate().await.is_ok());
    }

    #[tokio::test]
    async fn copy_produces_an_independent_fresh_handle() {
        let (uid, gid) = current_identity();
        let exec = ChildExecutor::new(uid, gid);
        let _ = exec
            .run("/bin/sh".to_string(), vec!["-c".to_string(), "true".to_string()])
            .await;

        let fresh = exec.copy();
        let info = fresh.info().await;
        assert_eq!(info.status, Status::Uninit);
        assert_eq!(info.pid, 0);
    }
}
