//! Execution context
//!
//! A `Context` is the service object every shell carries: spawn backend,
//! process logger, live-process registry, and the shared null output device.
//! Create one per program and share it through an `Arc`.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::ContextConfig;
use crate::fd::Pipe;
use crate::process::spawn::{ForkExecBackend, SpawnBackend};
use crate::process::tracker::ChildProcessTracker;
use crate::process::{ProcessLogger, TracingProcessLogger};

/// Shared services for launching processes and running builtins.
pub struct Context {
    config: ContextConfig,
    backend: Arc<dyn SpawnBackend>,
    logger: Arc<dyn ProcessLogger>,
    tracker: ChildProcessTracker,
    null_output: OnceCell<NullOutputDevice>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("backend", &self.backend)
            .field("live_processes", &self.tracker.pids())
            .field("null_output", &self.null_output.get())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl Context {
    /// Create a context using the platform spawn backend and tracing logger.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            backend: Arc::new(ForkExecBackend),
            logger: Arc::new(TracingProcessLogger),
            tracker: ChildProcessTracker::new(),
            null_output: OnceCell::new(),
        }
    }

    /// Replace the spawn backend.
    pub fn with_backend(mut self, backend: Arc<dyn SpawnBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the process logger.
    pub fn with_logger(mut self, logger: Arc<dyn ProcessLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Wrap in an `Arc` for sharing between shells.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn SpawnBackend> {
        &self.backend
    }

    pub(crate) fn logger(&self) -> &dyn ProcessLogger {
        self.logger.as_ref()
    }

    pub(crate) fn tracker(&self) -> &ChildProcessTracker {
        &self.tracker
    }

    /// PIDs of processes launched through this context and not yet reaped.
    pub fn live_processes(&self) -> Vec<i32> {
        self.tracker.pids()
    }

    /// Send SIGTERM to every live process.
    pub fn terminate_all(&self) {
        self.tracker.signal_all(nix::sys::signal::Signal::SIGTERM);
    }

    /// Write end of the shared null output device.
    ///
    /// Created on first use; the descriptor stays valid for the lifetime of
    /// this context. Must be called from within a tokio runtime.
    pub(crate) async fn null_output(&self) -> io::Result<RawFd> {
        let device = self
            .null_output
            .get_or_try_init(|| async { NullOutputDevice::create() })
            .await?;
        Ok(device.write_end.as_raw_fd())
    }
}

// ============================================================================
// Null Output Device
// ============================================================================

/// A pipe whose read end is drained and discarded by a background task.
///
/// Stands in for `/dev/null` on the output side: unlike the character
/// device it can be registered with the readiness reactor.
#[derive(Debug)]
struct NullOutputDevice {
    write_end: OwnedFd,
}

impl NullOutputDevice {
    fn create() -> io::Result<Self> {
        let (read_end, write_end) = Pipe::new()?.into_parts();
        let mut receiver = pipe::Receiver::from_owned_fd(read_end)?;
        // The task ends when the context (and with it the write end) drops
        // and every inherited copy has closed.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match receiver.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                    Err(error) => {
                        debug!(%error, "null_output.drain stopped");
                        break;
                    }
                }
            }
        });
        debug!(fd = %write_end.as_raw_fd(), "null_output.create complete");
        Ok(Self { write_end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_null_output_is_created_once() {
        let context = Context::default();
        let first = context.null_output().await.unwrap();
        let second = context.null_output().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_null_output_discards_writes() {
        let context = Context::default();
        let fd = context.null_output().await.unwrap();
        // SAFETY: the context keeps `fd` open for the duration of the test.
        let borrowed = unsafe { crate::fd::borrow_raw(fd) };
        let mut writer = std::fs::File::from(crate::fd::duplicate(borrowed).unwrap());
        // More than a pipe buffer; only completes if the drain keeps up.
        let payload = vec![b'x'; 256 * 1024];
        tokio::task::spawn_blocking(move || writer.write_all(&payload))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_no_live_processes_initially() {
        let context = Context::default();
        assert!(context.live_processes().is_empty());
        context.terminate_all();
    }
}
