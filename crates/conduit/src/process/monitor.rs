//! Descriptor-closure monitoring
//!
//! A `FileDescriptorMonitor` fires once every copy of a pipe's write end has
//! closed. Mapped into a child that inherits nothing else, the last copy
//! closes exactly when the child exits, which gives a termination signal
//! that suspends a task instead of blocking a thread.

use std::future::Future;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::warn;

use crate::fd::Pipe;

/// Liveness signal for a spawned process.
#[derive(Debug)]
pub struct FileDescriptorMonitor {
    receiver: pipe::Receiver,
}

impl FileDescriptorMonitor {
    /// Create a monitor and run `body` with its write end.
    ///
    /// `body` must duplicate the descriptor into whatever should keep the
    /// monitor open (typically a spawn request's descriptor mapping). The
    /// monitor's own copy is closed when `body` completes, before the
    /// monitor is returned, so [`wait`](Self::wait) can never observe it.
    pub async fn create<T, E, F, Fut>(body: F) -> Result<(T, Self), E>
    where
        F: FnOnce(BorrowedFd<'_>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<io::Error>,
    {
        let (read_end, write_end) = Pipe::new()?.into_parts();
        let receiver = pipe::Receiver::from_owned_fd(read_end)?;
        let result = body(write_end.as_fd()).await;
        drop(write_end);
        Ok((result?, Self { receiver }))
    }

    /// Wait until every copy of the write end has closed.
    pub async fn wait(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match self.receiver.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => warn!(bytes = %n, "monitor.wait unexpected data"),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fires_after_last_copy_closes() {
        let (copy, mut monitor) =
            FileDescriptorMonitor::create(|fd| std::future::ready(crate::fd::duplicate(fd)))
                .await
                .unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), monitor.wait()).await;
        assert!(pending.is_err(), "monitor fired while a copy was open");

        drop::<OwnedFd>(copy);
        tokio::time::timeout(Duration::from_secs(5), monitor.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fires_immediately_without_copies() {
        let ((), mut monitor) =
            FileDescriptorMonitor::create(|_| async { Ok::<_, io::Error>(()) })
                .await
                .unwrap();
        tokio::time::timeout(Duration::from_secs(5), monitor.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_body_error_is_returned() {
        let result = FileDescriptorMonitor::create(|_| async {
            Err::<(), _>(io::Error::other("body failed"))
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "body failed");
    }
}
