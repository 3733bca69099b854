//! Test helpers for drinit end-to-end tests: spawns the real `drinit`
//! binary and drives it over its control FIFO.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use uuid::Uuid;

pub struct TestSupervisor {
    process: Child,
    pub fifo_path: PathBuf,
    pub pid_file: PathBuf,
}

impl TestSupervisor {
    /// Spawn `drinit` supervising `/bin/sh -c <script>`. Any occurrence of
    /// `__PIDFILE__` in `script` is replaced with a unique path the script
    /// can write its own pid to.
    pub async fn start(script: &str) -> Self {
        let id = Uuid::new_v4();
        let fifo_path = std::env::temp_dir().join(format!("drinit-it-{id}.pipe"));
        let pid_file = std::env::temp_dir().join(format!("drinit-it-{id}.pid"));

        let bin = env!("CARGO_BIN_EXE_drinit");
        let process = Command::new(bin)
            .arg("--fd")
            .arg(&fifo_path)
            .arg("--")
            .arg("/bin/sh")
            .arg("-c")
            .arg(script.replace("__PIDFILE__", pid_file.to_str().unwrap()))
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn drinit binary");

        for _ in 0..50 {
            if fifo_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestSupervisor {
            process,
            fifo_path,
            pid_file,
        }
    }

    /// Poll for the supervised script to report its own pid.
    pub async fn child_pid(&self) -> Option<i32> {
        for _ in 0..50 {
            if let Ok(contents) = std::fs::read_to_string(&self.pid_file) {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    return Some(pid);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    pub fn child_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    pub async fn send(&self, name: &str, args: &[&str]) {
        let msg = drinit::ipc::Msg {
            epoch: 0,
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        };
        drinit::ipc::send(&self.fifo_path, msg)
            .await
            .expect("send ipc message");
    }
}

impl Drop for TestSupervisor {
    fn drop(&mut self) {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(self.process.id() as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        let _ = self.process.wait();
        let _ = std::fs::remove_file(&self.fifo_path);
        let _ = std::fs::remove_file(&self.pid_file);
    }
}
