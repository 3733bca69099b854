use std::fmt;
use std::io;

/// Error taxonomy for the supervisor and its components.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Nix(nix::errno::Errno),
    /// FIFO cannot be created, signal router cannot subscribe, or the
    /// user identity cannot be resolved. Fatal at construction time.
    SetupFatal(String),
    /// fork/exec returned an error.
    ChildStartFailed(String),
    /// terminate/signal attempted after the child already exited.
    ChildAlreadyGone,
    /// start attempted while running, or stop/signal attempted before any start.
    ChildNotRunning,
    /// IPC message with an unrecognized command name.
    UnknownCommand(String),
    /// IPC `signal` command with an unknown signal name.
    SignalNameInvalid(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Nix(e) => write!(f, "system call failed: {e}"),
            Error::SetupFatal(msg) => write!(f, "fatal setup error: {msg}"),
            Error::ChildStartFailed(msg) => write!(f, "child start failed: {msg}"),
            Error::ChildAlreadyGone => write!(f, "process already finished"),
            Error::ChildNotRunning => write!(f, "process not running"),
            Error::UnknownCommand(name) => write!(f, "unknown command: {name}"),
            Error::SignalNameInvalid(name) => write!(f, "invalid signal name: {name}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Nix(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
