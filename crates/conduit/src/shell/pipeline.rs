//! Operations and pipe composition
//!
//! An [`Operation`] is one pipeline stage: an external [`Command`], a
//! builtin, or a [`Pipeline`] of two operations. [`pipe`] runs two
//! operations concurrently with the first one's output connected to the
//! second one's input; longer pipelines nest:
//!
//! ```ignore
//! let text = shell
//!     .capture(Command::new("echo").arg("Foo").pipe(Command::new("sed").arg("s/Foo/Bar/")))
//!     .await?;
//! ```

use std::ffi::OsString;
use std::os::fd::AsRawFd;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::builtin::builtin;
use super::types::{Input, Output, Shell};
use crate::error::Result;
use crate::fd::Pipe;

// ============================================================================
// Operation
// ============================================================================

/// A unit of work that consumes a shell's input and produces its output.
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    fn run(self, shell: Shell) -> BoxFuture<'static, Result<Self::Output>>;
}

/// Composition helpers for every operation.
pub trait OperationExt: Operation + Sized {
    /// Connect this operation's standard output to `destination`'s input.
    fn pipe<B: Operation>(self, destination: B) -> Pipeline<Self, B> {
        Pipeline {
            source: self,
            destination,
            stream: PipedStream::Output,
        }
    }

    /// Connect this operation's standard error to `destination`'s input.
    fn pipe_error<B: Operation>(self, destination: B) -> Pipeline<Self, B> {
        Pipeline {
            source: self,
            destination,
            stream: PipedStream::Error,
        }
    }
}

impl<T: Operation> OperationExt for T {}

// ============================================================================
// Command
// ============================================================================

/// An external executable and its arguments.
///
/// The program is resolved along the running shell's `PATH` unless it
/// contains a `/`.
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    arguments: Vec<OsString>,
}

impl Command {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
        }
    }

    pub fn arg(mut self, argument: impl Into<OsString>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn args(mut self, arguments: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }
}

impl Operation for Command {
    type Output = ();

    fn run(self, shell: Shell) -> BoxFuture<'static, Result<()>> {
        async move {
            let executable = shell.executable(&self.program)?;
            shell.execute(executable, self.arguments).await
        }
        .boxed()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Which of the source's streams a pipeline connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipedStream {
    Output,
    Error,
}

/// Two operations connected by a pipe. Its output is the destination's.
#[derive(Debug, Clone)]
pub struct Pipeline<A, B> {
    source: A,
    destination: B,
    stream: PipedStream,
}

impl<A: Operation, B: Operation> Operation for Pipeline<A, B> {
    type Output = B::Output;

    fn run(self, shell: Shell) -> BoxFuture<'static, Result<B::Output>> {
        async move { connect(&shell, self.source, self.destination, self.stream).await }.boxed()
    }
}

/// Run `source` and `destination` concurrently, `source`'s output feeding
/// `destination`'s input.
pub async fn pipe<A: Operation, B: Operation>(
    shell: &Shell,
    source: A,
    destination: B,
) -> Result<B::Output> {
    connect(shell, source, destination, PipedStream::Output).await
}

/// Like [`pipe`], but feeds `source`'s standard error instead.
pub async fn pipe_error<A: Operation, B: Operation>(
    shell: &Shell,
    source: A,
    destination: B,
) -> Result<B::Output> {
    connect(shell, source, destination, PipedStream::Error).await
}

async fn connect<A: Operation, B: Operation>(
    shell: &Shell,
    source: A,
    destination: B,
    stream: PipedStream,
) -> Result<B::Output> {
    let (read_end, write_end) = Pipe::new()?.into_parts();

    // SAFETY: each end is moved into the future running the side that uses
    // it and dropped only once that side has completed.
    let (source_shell, destination_shell) = unsafe {
        let writer = Output::unmanaged(write_end.as_raw_fd());
        let source_shell = match stream {
            PipedStream::Output => shell.with_output(writer),
            PipedStream::Error => shell.with_error(writer),
        };
        (
            source_shell,
            shell.with_input(Input::unmanaged(read_end.as_raw_fd())),
        )
    };

    // Closing its end when done is what lets the other side see EOF (or
    // EPIPE). Both sides always run to completion.
    let source_run = async move {
        let result = source.run(source_shell).await;
        drop(write_end);
        result
    };
    let destination_run = async move {
        let result = destination.run(destination_shell).await;
        drop(read_end);
        result
    };
    let (source_result, destination_result) = futures::join!(source_run, destination_run);

    match source_result {
        Ok(_) => {}
        Err(error) if error.is_broken_pipe() => {
            debug!(%error, "pipe.source suppressed broken pipe");
        }
        Err(error) => {
            if let Err(destination_error) = &destination_result {
                debug!(error = %destination_error, "pipe.destination also failed");
            }
            return Err(error);
        }
    }
    destination_result
}

// ============================================================================
// Shell entry points
// ============================================================================

impl Shell {
    /// Run an operation in this shell.
    pub async fn run<O: Operation>(&self, operation: O) -> Result<O::Output> {
        operation.run(self.clone()).await
    }

    /// Run `operation` and collect its standard output as text.
    pub async fn capture<O: Operation>(&self, operation: O) -> Result<String> {
        let collect = builtin(|mut channels| async move {
            Ok(channels.input.read_to_string().await?)
        });
        pipe(self, operation, collect).await
    }

    /// Run `operation` and collect its standard output as lines.
    pub async fn lines<O: Operation>(&self, operation: O) -> Result<Vec<String>> {
        let collect = builtin(|mut channels| async move {
            Ok(channels.input.lines()?.collect().await?)
        });
        pipe(self, operation, collect).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::{ShellError, TerminationError};
    use crate::shell::environment::Environment;
    use std::path::PathBuf;

    fn shell() -> Shell {
        Shell::new(
            Context::default().shared(),
            PathBuf::from("/"),
            Environment::from_pairs([("PATH", "/usr/bin:/bin")]),
        )
    }

    #[tokio::test]
    async fn test_builtin_to_builtin() {
        let source = builtin(|mut channels| async move {
            channels.output.write_all("one\ntwo\n").await?;
            Ok(())
        });
        let lines = shell().lines(source).await.unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_source_failure_surfaces() {
        let result = shell()
            .capture(Command::new("sh").args(["-c", "echo partial; exit 3"]))
            .await;
        assert!(result.unwrap_err().is_exit_status(3));
    }

    #[tokio::test]
    async fn test_early_exit_destination_suppresses_broken_pipe() {
        let source = Command::new("yes");
        let destination = Command::new("head").args(["-n", "1"]);
        let text = shell().capture(source.pipe(destination)).await.unwrap();
        assert_eq!(text, "y\n");
    }

    #[tokio::test]
    async fn test_builtin_source_broken_pipe_suppressed() {
        let source = builtin(|mut channels| async move {
            let chunk = "x".repeat(4096);
            loop {
                if let Err(error) = channels.output.write_all(&chunk).await {
                    return Err::<(), anyhow::Error>(error.into());
                }
            }
        });
        let destination = builtin(|_channels| async move { Ok("done") });
        let result = pipe(&shell(), source, destination).await.unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn test_pipe_error_stream() {
        let source = Command::new("sh").args(["-c", "echo err >&2"]);
        let text = shell().capture(source.pipe_error(Command::new("cat"))).await;
        assert_eq!(text.unwrap(), "err\n");
    }

    #[tokio::test]
    async fn test_not_found() {
        let result = shell().run(Command::new("nonexistent_command_12345")).await;
        assert!(matches!(result, Err(ShellError::ExecutableNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_shell_does_not_launch() {
        let shell = shell();
        shell.kill_signal().send_sigterm();
        let result = shell.run(Command::new("true")).await;
        assert!(matches!(
            result,
            Err(ShellError::Termination(TerminationError::Cancelled))
        ));
    }
}
