//! Live process registry
//!
//! Tracks the processes a context has launched but not yet reaped, so a
//! hosting program can terminate them all on interrupt.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Tracks child processes between launch and reap.
#[derive(Debug, Clone, Default)]
pub struct ChildProcessTracker {
    pids: Arc<Mutex<BTreeSet<i32>>>,
}

impl ChildProcessTracker {
    /// Create a new process tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a launched process.
    pub fn track(&self, pid: i32) {
        self.lock().insert(pid);
    }

    /// Untrack a process once it has been reaped.
    pub fn untrack(&self, pid: i32) {
        self.lock().remove(&pid);
    }

    /// All tracked PIDs, in ascending order.
    pub fn pids(&self) -> Vec<i32> {
        self.lock().iter().copied().collect()
    }

    /// Send `signal` to every tracked process.
    ///
    /// Processes stay tracked; their reapers untrack them once they exit.
    pub fn signal_all(&self, signal: Signal) {
        for pid in self.pids() {
            if let Err(errno) = kill(Pid::from_raw(pid), signal) {
                debug!(pid = %pid, %errno, "tracker.signal skipped");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<i32>> {
        self.pids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
