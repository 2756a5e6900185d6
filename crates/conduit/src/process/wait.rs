//! Reaping and exit-status decoding

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::ProcessId;
use crate::config::ContextConfig;
use crate::error::TerminationError;
use crate::shell::signal::{KillSignal, SignalKind};

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this status (zero is success).
    Exited(i32),
    /// Killed by a signal it did not handle.
    Signaled { signal: i32, core_dumped: bool },
}

impl ExitStatus {
    /// Decode a raw `waitpid` status word.
    ///
    /// Returns `None` for stop/continue notifications, which are only
    /// reported when asked for.
    pub fn from_raw(status: libc::c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(Self::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(Self::Signaled {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            })
        } else {
            None
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Success, or the matching termination error.
    pub fn into_result(self) -> Result<(), TerminationError> {
        match self {
            Self::Exited(0) => Ok(()),
            Self::Exited(code) => Err(TerminationError::NonzeroExitStatus(code)),
            Self::Signaled {
                signal,
                core_dumped,
            } => Err(TerminationError::UncaughtSignal {
                signal,
                core_dumped,
            }),
        }
    }
}

/// Deliver `signal` to `pid`, falling back to SIGTERM for numbers the
/// platform does not name.
pub(crate) fn deliver(pid: ProcessId, signal: SignalKind) {
    let signal = signal.to_nix().unwrap_or(Signal::SIGTERM);
    match kill(Pid::from_raw(pid.as_raw()), signal) {
        Ok(()) => debug!(pid = %pid, ?signal, "process.cancel"),
        // Already exited, waiting to be reaped.
        Err(Errno::ESRCH) => {}
        Err(errno) => warn!(pid = %pid, ?signal, %errno, "process.cancel failed"),
    }
}

/// Reap `pid` without blocking a thread.
///
/// Called after the process's monitor fired. Because the monitor closing
/// and the kernel marking the process waitable are not atomic, a
/// non-blocking wait may still report the process as running; that case is
/// retried after the configured delay. An abort arriving while retrying is
/// delivered to the process once. Returns the status and whether a signal
/// was delivered here.
pub(crate) async fn reap(
    pid: ProcessId,
    config: &ContextConfig,
    kill_signal: &KillSignal,
    mut delivered: bool,
) -> (Result<ExitStatus, TerminationError>, bool) {
    let mut attempts: u32 = 0;
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: non-blocking waitpid on a child we spawned.
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::WNOHANG) };
        match rc {
            -1 => {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                return (
                    Err(TerminationError::WaitFailed {
                        return_value: rc,
                        errno,
                    }),
                    delivered,
                );
            }
            0 => {
                attempts += 1;
                if let Some(max) = config.max_wait_retries {
                    if attempts > max {
                        return (
                            Err(TerminationError::NotWaitable {
                                pid: pid.as_raw(),
                                attempts,
                            }),
                            delivered,
                        );
                    }
                }
                if attempts > 1 {
                    warn!(pid = %pid, attempts = %attempts, "process.wait retry");
                } else {
                    debug!(pid = %pid, "process.wait retry");
                }
                tokio::select! {
                    _ = tokio::time::sleep(config.wait_retry_delay()) => {}
                    signal = kill_signal.wait_aborted(), if !delivered => {
                        deliver(pid, signal);
                        delivered = true;
                    }
                }
            }
            _ => {
                if let Some(exit) = ExitStatus::from_raw(status) {
                    debug!(pid = %pid, ?exit, "process.reaped");
                    return (Ok(exit), delivered);
                }
            }
        }
    }
}
