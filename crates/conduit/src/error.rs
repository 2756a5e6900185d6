//! Error types for process orchestration
//!
//! Errors are split by the phase that produced them:
//! - `SpawnError` - the process could not be launched
//! - `TerminationError` - the process ran, but did not terminate successfully
//! - `ChannelError` - a builtin's input or output channel failed
//! - `ShellError` - umbrella type returned by shell operations

use std::io;

use nix::errno::Errno;
use thiserror::Error;

// ============================================================================
// Spawn Errors
// ============================================================================

/// Failure to launch a child process.
///
/// These are environment-facing errors (bad path, permissions, descriptor
/// exhaustion) and are never retried.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// A parameter cannot be passed to the operating system as-is.
    #[error("invalid spawn parameter {parameter:?}: {issue}")]
    InvalidParameter { parameter: String, issue: &'static str },

    /// A system call made while launching the process failed.
    #[error("{call} failed at {file}:{line} (returned {return_value}): {errno}")]
    Syscall {
        call: &'static str,
        file: &'static str,
        line: u32,
        return_value: i64,
        errno: Errno,
    },

    /// The spawn primitive reported success without a usable process id.
    #[error("spawn did not produce a valid process id (got {0})")]
    NoProcessId(i32),
}

impl SpawnError {
    pub(crate) fn invalid_parameter(parameter: impl Into<String>, issue: &'static str) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            issue,
        }
    }

    /// The raw OS error number, if this error came from a system call.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

// ============================================================================
// Termination Errors
// ============================================================================

/// A spawned process did not terminate successfully.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// The wait system call itself failed. Not retried.
    #[error("waiting on process failed (returned {return_value}): {errno}")]
    WaitFailed { return_value: i32, errno: Errno },

    /// The process exited normally with a nonzero status.
    #[error("process exited with status {0}")]
    NonzeroExitStatus(i32),

    /// The process was terminated by a signal it did not handle.
    #[error("process terminated by uncaught signal {signal}{}", core_suffix(.core_dumped))]
    UncaughtSignal { signal: i32, core_dumped: bool },

    /// The process never became waitable within the configured retry budget.
    #[error("process {pid} was not waitable after {attempts} attempts")]
    NotWaitable { pid: i32, attempts: u32 },

    /// The invocation was cancelled. Supersedes whatever status the
    /// cancellation signal produced.
    #[error("process invocation was cancelled")]
    Cancelled,
}

fn core_suffix(core_dumped: &bool) -> &'static str {
    if *core_dumped {
        " (core dumped)"
    } else {
        ""
    }
}

// ============================================================================
// Channel Errors
// ============================================================================

/// Failure in a builtin's I/O channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The input side of a channel wraps a non-replayable stream.
    #[error("builtin input can only be consumed once")]
    InputAlreadyConsumed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ============================================================================
// Shell Errors
// ============================================================================

/// Error returned by shell operations (process invocations, builtins, pipes).
#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Termination(#[from] TerminationError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// No executable with this name was found on the search path.
    #[error("{0}: command not found")]
    ExecutableNotFound(String),

    /// A background task driving the operation panicked or was aborted.
    #[error("operation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A builtin failed with its own error.
    #[error(transparent)]
    Builtin(#[from] anyhow::Error),
}

impl ShellError {
    /// The termination error, if this is one.
    pub fn termination(&self) -> Option<&TerminationError> {
        match self {
            Self::Termination(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the process exited normally with this specific status.
    pub fn is_exit_status(&self, status: i32) -> bool {
        matches!(
            self.termination(),
            Some(TerminationError::NonzeroExitStatus(code)) if *code == status
        )
    }

    /// Whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.termination(), Some(TerminationError::Cancelled))
    }

    /// Whether this failure is the expected outcome of writing into a pipe
    /// whose reader already went away.
    ///
    /// Processes die of an uncaught SIGPIPE. Builtins run inside a process
    /// that ignores SIGPIPE, so they see `EPIPE` on write instead.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            Self::Termination(TerminationError::UncaughtSignal {
                signal,
                core_dumped: false,
            }) => *signal == nix::libc::SIGPIPE,
            Self::Io(error) | Self::Channel(ChannelError::Io(error)) => {
                error.kind() == io::ErrorKind::BrokenPipe
            }
            Self::Builtin(error) => {
                let io_error = match error.downcast_ref::<ChannelError>() {
                    Some(ChannelError::Io(e)) => Some(e),
                    _ => error.downcast_ref::<io::Error>(),
                };
                io_error.is_some_and(|e| e.kind() == io::ErrorKind::BrokenPipe)
            }
            _ => false,
        }
    }

    /// Exit code a hosting program should use to report this failure,
    /// following shell conventions.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Termination(TerminationError::NonzeroExitStatus(code)) => *code,
            Self::Termination(TerminationError::UncaughtSignal { signal, .. }) => 128 + signal,
            Self::Termination(TerminationError::Cancelled) => 128 + nix::libc::SIGTERM,
            Self::ExecutableNotFound(_) => 127,
            Self::Spawn(_) => 126,
            _ => 1,
        }
    }
}

/// Result alias for shell operations.
pub type Result<T, E = ShellError> = std::result::Result<T, E>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let nonzero = ShellError::from(TerminationError::NonzeroExitStatus(3));
        assert_eq!(nonzero.exit_code(), 3);
        assert!(nonzero.is_exit_status(3));
        assert!(!nonzero.is_exit_status(1));

        let signaled = ShellError::from(TerminationError::UncaughtSignal {
            signal: 9,
            core_dumped: false,
        });
        assert_eq!(signaled.exit_code(), 137);

        assert_eq!(ShellError::from(TerminationError::Cancelled).exit_code(), 143);
        assert_eq!(ShellError::ExecutableNotFound("nope".into()).exit_code(), 127);
    }

    #[test]
    fn test_broken_pipe_shapes() {
        let sigpipe = ShellError::from(TerminationError::UncaughtSignal {
            signal: nix::libc::SIGPIPE,
            core_dumped: false,
        });
        assert!(sigpipe.is_broken_pipe());

        let dumped = ShellError::from(TerminationError::UncaughtSignal {
            signal: nix::libc::SIGPIPE,
            core_dumped: true,
        });
        assert!(!dumped.is_broken_pipe());

        let epipe = ShellError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(epipe.is_broken_pipe());

        let wrapped = ShellError::from(anyhow::Error::from(io::Error::from(
            io::ErrorKind::BrokenPipe,
        )));
        assert!(wrapped.is_broken_pipe());

        // A nonzero exit is never a broken pipe, even with SIGPIPE's number.
        let status = ShellError::from(TerminationError::NonzeroExitStatus(nix::libc::SIGPIPE));
        assert!(!status.is_broken_pipe());
    }

    #[test]
    fn test_signal_message_mentions_core() {
        let error = TerminationError::UncaughtSignal {
            signal: 11,
            core_dumped: true,
        };
        assert_eq!(
            error.to_string(),
            "process terminated by uncaught signal 11 (core dumped)"
        );
    }
}
