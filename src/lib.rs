//! drinit - a minimal container init (PID 1) process supervisor.
//!
//! Launches a single long-running child program, forwards signals to it,
//! reaps orphaned descendants, traps configurable signals to run hook
//! scripts, and accepts control commands over a local FIFO.

pub mod child;
pub mod error;
pub mod ipc;
pub mod reaper;
pub mod signals;
pub mod supervisor;

pub use error::{Error, Result};
