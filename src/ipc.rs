//! IPC Pipe: a half-duplex byte-stream command transport bound to a
//! FIFO on the filesystem. Newline-delimited, whitespace-separated
//! wire format: `<epoch-seconds> <name> [arg ...]\n`.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// A control message parsed from the FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub epoch: i64,
    pub name: String,
    pub args: Vec<String>,
}

impl Msg {
    /// Parse one line of the wire format. Returns `None` for malformed
    /// lines (fewer than the epoch + name tokens).
    pub fn parse(line: &str) -> Option<Msg> {
        let mut parts = line.trim_end_matches('\n').split_whitespace();
        let epoch_tok = parts.next()?;
        let name = parts.next()?.to_string();
        let args: Vec<String> = parts.map(String::from).collect();
        let epoch = epoch_tok.parse::<i64>().unwrap_or_else(|_| now_epoch_secs());
        Some(Msg { epoch, name, args })
    }

    pub fn to_line(&self) -> String {
        let mut s = format!("{} {}", self.epoch, self.name);
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s.push('\n');
        s
    }
}

/// Owns a named FIFO and the control channel's read side.
pub struct Pipe {
    path: PathBuf,
    closed: Arc<AtomicBool>,
    reader_started: AtomicBool,
    file: Mutex<Option<std::fs::File>>,
}

impl Pipe {
    /// Delete any pre-existing file at `path`, create a fresh FIFO with
    /// mode 0600, then open it read-write, non-blocking, append.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let _ = std::fs::remove_file(&path);
        mkfifo(&path, Mode::from_bits_truncate(0o600))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;

        Ok(Pipe {
            path,
            closed: Arc::new(AtomicBool::new(false)),
            reader_started: AtomicBool::new(false),
            file: Mutex::new(Some(file)),
        })
    }

    /// Lazily start the single reader task and return the message stream.
    /// The reader is started at most once; a second call returns `None`.
    pub fn open(&self) -> Option<mpsc::Receiver<Msg>> {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            warn!("ipc pipe: open() called more than once");
            return None;
        }

        let file = self
            .file
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(file) = file else {
            return None;
        };

        let (tx, rx) = mpsc::channel(1);
        let closed = self.closed.clone();
        tokio::spawn(reader_loop(file, tx, closed));
        Some(rx)
    }

    /// Mark the pipe closed and remove the FIFO from the filesystem.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn reader_loop(file: std::fs::File, tx: mpsc::Sender<Msg>, closed: Arc<AtomicBool>) {
    let async_fd = match AsyncFd::new(file) {
        Ok(f) => f,
        Err(e) => {
            warn!("ipc pipe: failed to register fifo fd for polling: {e}");
            return;
        }
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let mut guard = match async_fd.readable().await {
            Ok(g) => g,
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("ipc pipe: poll error: {e}");
                continue;
            }
        };

        match guard.try_io(|inner| inner.get_ref().read(&mut chunk)) {
            Ok(Ok(0)) => {
                // Opened read-write, so a writer disconnecting does not
                // produce EOF here; nothing to do but keep polling.
            }
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                    match Msg::parse(&line) {
                        Some(msg) => {
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        None => warn!("ipc pipe: dropping malformed message: {line:?}"),
                    }
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("ipc pipe: transient read error: {e}");
            }
            Err(_would_block) => continue,
        }
    }

    debug!("ipc pipe: reader task exiting");
}

/// Independent writer: open the path write-only, non-blocking, write the
/// serialized message, and close. Overwrites `msg.epoch` with the
/// current wall time in seconds.
pub async fn send(path: impl AsRef<Path>, mut msg: Msg) -> Result<()> {
    msg.epoch = now_epoch_secs();
    let line = msg.to_line();
    let path = path.as_ref().to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        f.write_all(line.as_bytes())?;
        Ok(())
    })
    .await
    .map_err(|e| Error::SetupFatal(format!("send task panicked: {e}")))??;

    Ok(())
}
