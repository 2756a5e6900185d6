//! Process lifecycle
//!
//! Launching a process maps a [`FileDescriptorMonitor`] into it alongside
//! its standard streams, then hands the monitor to a reaper task:
//!
//! ```text
//! launched -> monitoring -> exited(status) | cancelled
//! ```
//!
//! The reaper waits for the monitor (or an abort from the kill signal), then
//! reaps the process with a non-blocking wait. A process is always reaped,
//! including when it was cancelled or its handle was dropped.

pub mod monitor;
pub mod spawn;
pub mod tracker;
pub mod wait;

use std::ffi::OsString;
use std::fmt;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Result, ShellError, SpawnError, TerminationError};
use crate::fd::lowest_unused;
use crate::shell::signal::KillSignal;
use monitor::FileDescriptorMonitor;
use spawn::SpawnRequest;
use wait::{deliver, reap};

// ============================================================================
// Process Id
// ============================================================================

/// Platform process id of a spawned process. Never zero or negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(i32);

impl ProcessId {
    pub fn new(raw: i32) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Logger Hooks
// ============================================================================

/// Observational hooks around a process's lifecycle.
///
/// Implementations must not affect control flow; every method defaults to
/// doing nothing.
pub trait ProcessLogger: Send + Sync {
    fn will_launch(&self, _executable: &Path, _arguments: &[OsString]) {}
    fn did_launch(&self, _pid: ProcessId) {}
    fn failed_to_launch(&self, _error: &SpawnError) {}
    fn will_wait(&self, _pid: ProcessId) {}
    fn did_terminate(&self, _pid: ProcessId, _error: Option<&TerminationError>) {}
}

/// Forwards lifecycle hooks to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProcessLogger;

impl ProcessLogger for TracingProcessLogger {
    fn will_launch(&self, executable: &Path, arguments: &[OsString]) {
        debug!(executable = %executable.display(), ?arguments, "process.spawn");
    }

    fn did_launch(&self, pid: ProcessId) {
        info!(pid = %pid, "process.launched");
    }

    fn failed_to_launch(&self, error: &SpawnError) {
        warn!(%error, "process.spawn failed");
    }

    fn will_wait(&self, pid: ProcessId) {
        debug!(pid = %pid, "process.wait");
    }

    fn did_terminate(&self, pid: ProcessId, error: Option<&TerminationError>) {
        match error {
            None => debug!(pid = %pid, "process.terminated"),
            Some(error) => debug!(pid = %pid, %error, "process.terminated"),
        }
    }
}

// ============================================================================
// Launch
// ============================================================================

/// Standard stream descriptors for a launch, borrowed for its duration.
#[derive(Debug, Clone, Copy)]
pub struct StandardStreams<'a> {
    pub input: BorrowedFd<'a>,
    pub output: BorrowedFd<'a>,
    pub error: BorrowedFd<'a>,
}

/// Entry points for launching processes.
pub struct Process;

impl Process {
    /// Launch a process and start monitoring it.
    ///
    /// `request` supplies path, arguments, environment and directory; its
    /// descriptor mapping gains the standard streams and the monitor.
    /// Returns once the process has reached `execve`.
    pub async fn launch(
        context: &Arc<Context>,
        mut request: SpawnRequest,
        streams: StandardStreams<'_>,
        kill_signal: &KillSignal,
    ) -> Result<RunningProcess> {
        let kill_signal = kill_signal.child_signal();
        if kill_signal.aborted_with().is_some() {
            return Err(TerminationError::Cancelled.into());
        }
        let logger = context.logger();
        logger.will_launch(&request.executable, &request.arguments);

        for (fd, target) in [(streams.input, 0), (streams.output, 1), (streams.error, 2)] {
            if let Err(error) = request.descriptors.add(fd, target) {
                logger.failed_to_launch(&error);
                return Err(error.into());
            }
        }

        let (sender, receiver) = oneshot::channel();
        let task = tokio::spawn(start(
            Arc::clone(context),
            request,
            kill_signal.clone(),
            sender,
        ));

        // Dropping the launch mid-spawn cancels the process; the task still
        // reaps it.
        let guard = kill_signal.clone().drop_guard();
        let launched = receiver.await;
        guard.disarm();

        let pid = match launched {
            Ok(result) => result?,
            Err(_) => {
                // The task ended without reporting, so it panicked.
                let _ = task.await?;
                return Err(TerminationError::Cancelled.into());
            }
        };
        Ok(RunningProcess {
            id: pid,
            kill_signal,
            task,
            context: Arc::clone(context),
        })
    }

    /// Launch a process and wait for it to terminate.
    pub async fn run(
        context: &Arc<Context>,
        request: SpawnRequest,
        streams: StandardStreams<'_>,
        kill_signal: &KillSignal,
    ) -> Result<()> {
        Self::launch(context, request, streams, kill_signal)
            .await?
            .wait()
            .await
    }
}

/// Spawn and supervise one process.
///
/// Runs detached from the launching future, so a process whose launch was
/// abandoned mid-spawn is still tracked and reaped.
async fn start(
    context: Arc<Context>,
    mut request: SpawnRequest,
    kill_signal: KillSignal,
    launched: oneshot::Sender<Result<ProcessId>>,
) -> std::result::Result<(), TerminationError> {
    if kill_signal.aborted_with().is_some() {
        let _ = launched.send(Err(TerminationError::Cancelled.into()));
        return Err(TerminationError::Cancelled);
    }

    let backend = Arc::clone(context.backend());
    let spawned = FileDescriptorMonitor::create(|monitor_fd| {
        let target = lowest_unused(request.descriptors.targets());
        let mapped = request.descriptors.add(monitor_fd, target);
        async move {
            mapped?;
            let pid = tokio::task::spawn_blocking(move || backend.spawn(request)).await??;
            Ok::<_, ShellError>(pid)
        }
    })
    .await;

    let (pid, monitor) = match spawned {
        Ok(spawned) => spawned,
        Err(error) => {
            if let ShellError::Spawn(spawn_error) = &error {
                context.logger().failed_to_launch(spawn_error);
            }
            let _ = launched.send(Err(error));
            // Nothing was started, so there is nothing to supervise.
            return Ok(());
        }
    };
    context.logger().did_launch(pid);
    context.tracker().track(pid.as_raw());

    // If the launcher is gone its drop guard has already aborted the kill
    // signal, and supervising terminates the process.
    let _ = launched.send(Ok(pid));
    supervise(context, pid, monitor, kill_signal).await
}

/// Reaper task: monitor, deliver aborts, reap, classify.
async fn supervise(
    context: Arc<Context>,
    pid: ProcessId,
    mut monitor: FileDescriptorMonitor,
    kill_signal: KillSignal,
) -> std::result::Result<(), TerminationError> {
    let mut delivered = false;
    tokio::select! {
        result = monitor.wait() => {
            if let Err(error) = result {
                warn!(pid = %pid, %error, "monitor.wait failed");
            }
        }
        signal = kill_signal.wait_aborted() => {
            deliver(pid, signal);
            delivered = true;
            // Still wait for the exit, so the process is reaped.
            if let Err(error) = monitor.wait().await {
                warn!(pid = %pid, %error, "monitor.wait failed");
            }
        }
    }

    let (status, delivered) = reap(pid, context.config(), &kill_signal, delivered).await;
    context.tracker().untrack(pid.as_raw());

    let result = match status {
        // A signal we sent ourselves is not the process's outcome.
        Ok(_) if delivered => Err(TerminationError::Cancelled),
        Ok(status) => status.into_result(),
        Err(error) => Err(error),
    };
    context.logger().did_terminate(pid, result.as_ref().err());
    result
}

// ============================================================================
// Running Process
// ============================================================================

/// A launched process that has not been waited on yet.
///
/// Dropping the handle does not kill the process; it is still reaped in
/// the background.
#[derive(Debug)]
pub struct RunningProcess {
    id: ProcessId,
    kill_signal: KillSignal,
    task: JoinHandle<std::result::Result<(), TerminationError>>,
    context: Arc<Context>,
}

impl RunningProcess {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Ask the process to terminate (SIGTERM). The process is still reaped
    /// and [`wait`](Self::wait) reports [`TerminationError::Cancelled`].
    pub fn cancel(&self) {
        self.kill_signal.send_sigterm();
    }

    /// Wait for termination.
    ///
    /// Dropping this future before it completes cancels the process.
    pub async fn wait(self) -> Result<()> {
        self.context.logger().will_wait(self.id);
        let guard = self.kill_signal.clone().drop_guard();
        let result = self.task.await;
        guard.disarm();
        Ok(result??)
    }
}
