//! Core shell types
//!
//! - `Input` / `Output` - where a stage's standard streams come from and go
//! - `Shell` - working directory, environment, streams and kill signal for
//!   one stage; derived shells never affect the shell they came from

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::environment::Environment;
use super::signal::KillSignal;
use crate::channel::{BuiltinInput, BuiltinOutput, Channels, InputStream, Registration};
use crate::context::Context;
use crate::error::{Result, ShellError};
use crate::fd::{borrow_raw, Pipe};
use crate::process::spawn::SpawnRequest;
use crate::process::{Process, RunningProcess, StandardStreams};

// ============================================================================
// Input / Output
// ============================================================================

/// Source of a stage's standard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// This process's standard input.
    StandardInput,
    /// Immediate end-of-file.
    NullDevice,
    /// A descriptor owned by someone else. See [`Input::unmanaged`].
    Unmanaged(RawFd),
}

impl Input {
    /// Read from a descriptor the caller owns.
    ///
    /// # Safety
    /// `fd` must stay open for as long as any shell holding this input runs
    /// operations.
    pub unsafe fn unmanaged(fd: RawFd) -> Self {
        Self::Unmanaged(fd)
    }

    pub(crate) fn resolve(&self) -> io::Result<Resolved> {
        Ok(match self {
            Self::StandardInput => Resolved::Standard(0),
            Self::NullDevice => Resolved::Owned(Pipe::half_closed_reader()?),
            Self::Unmanaged(fd) => Resolved::Borrowed(*fd),
        })
    }
}

/// Destination of a stage's standard output or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    StandardOutput,
    StandardError,
    /// Discarded.
    NullDevice,
    /// A descriptor owned by someone else. See [`Output::unmanaged`].
    Unmanaged(RawFd),
}

impl Output {
    /// Write to a descriptor the caller owns.
    ///
    /// # Safety
    /// `fd` must stay open for as long as any shell holding this output runs
    /// operations.
    pub unsafe fn unmanaged(fd: RawFd) -> Self {
        Self::Unmanaged(fd)
    }

    pub(crate) async fn resolve(&self, context: &Context) -> io::Result<Resolved> {
        Ok(match self {
            Self::StandardOutput => Resolved::Standard(1),
            Self::StandardError => Resolved::Standard(2),
            Self::NullDevice => Resolved::Borrowed(context.null_output().await?),
            Self::Unmanaged(fd) => Resolved::Borrowed(*fd),
        })
    }
}

/// A stream resolved to a concrete descriptor for the length of one
/// operation. Owned temporaries close when this drops.
#[derive(Debug)]
pub(crate) enum Resolved {
    /// One of this process's standard streams.
    Standard(RawFd),
    /// Kept open by its owner (the context, or the caller of `unmanaged`).
    Borrowed(RawFd),
    Owned(OwnedFd),
}

impl Resolved {
    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            // SAFETY: standard streams stay open for the life of the
            // process; borrowed descriptors are kept open by their owner
            // (see `Input::unmanaged`, `Output::unmanaged`).
            Self::Standard(fd) | Self::Borrowed(fd) => unsafe { borrow_raw(*fd) },
            Self::Owned(fd) => fd.as_fd(),
        }
    }

    /// Only descriptors nobody else holds may go to the reactor: it sets
    /// `O_NONBLOCK` on the open file description, which processes launched
    /// with a shared copy would inherit.
    pub(crate) fn registration(&self) -> Registration {
        match self {
            Self::Standard(_) | Self::Borrowed(_) => Registration::Blocking,
            Self::Owned(_) => Registration::Reactor,
        }
    }
}

// ============================================================================
// Shell
// ============================================================================

/// Everything a stage runs with.
///
/// A shell is a value: the `with_*`/`pushing`/`subshell` methods return a
/// modified copy and leave `self` untouched.
#[derive(Debug, Clone)]
pub struct Shell {
    directory: PathBuf,
    environment: Environment,
    input: Input,
    output: Output,
    error: Output,
    context: Arc<Context>,
    kill_signal: KillSignal,
}

impl Shell {
    /// A shell bound to the standard streams.
    pub fn new(context: Arc<Context>, directory: PathBuf, environment: Environment) -> Self {
        Self {
            directory,
            environment,
            input: Input::StandardInput,
            output: Output::StandardOutput,
            error: Output::StandardError,
            context,
            kill_signal: KillSignal::default(),
        }
    }

    /// A shell with this process's working directory and environment.
    pub fn from_process(context: Arc<Context>) -> io::Result<Self> {
        Ok(Self::new(
            context,
            std::env::current_dir()?,
            Environment::process(),
        ))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn input(&self) -> Input {
        self.input
    }

    pub fn output(&self) -> Output {
        self.output
    }

    pub fn error(&self) -> Output {
        self.error
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn kill_signal(&self) -> &KillSignal {
        &self.kill_signal
    }

    /// Change directory: relative paths are joined, absolute ones replace.
    pub fn pushing(&self, path: impl AsRef<Path>) -> Self {
        Self {
            directory: self.directory.join(path),
            ..self.clone()
        }
    }

    /// Set (or with `None`, unset) an environment variable.
    pub fn with_env<K, V>(&self, name: K, value: Option<V>) -> Self
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut shell = self.clone();
        shell.environment.set(name, value);
        shell
    }

    pub fn with_environment(&self, environment: Environment) -> Self {
        Self {
            environment,
            ..self.clone()
        }
    }

    pub fn with_input(&self, input: Input) -> Self {
        Self {
            input,
            ..self.clone()
        }
    }

    pub fn with_output(&self, output: Output) -> Self {
        Self {
            output,
            ..self.clone()
        }
    }

    pub fn with_error(&self, error: Output) -> Self {
        Self {
            error,
            ..self.clone()
        }
    }

    /// A copy whose kill signal is a child of this shell's: killing this
    /// shell reaches the subshell's processes, not the other way around.
    pub fn subshell(&self) -> Self {
        Self {
            kill_signal: self.kill_signal.child_signal(),
            ..self.clone()
        }
    }

    /// Resolve `name` to an executable path along this shell's `PATH`.
    ///
    /// Names containing `/` resolve relative to the working directory.
    pub fn executable(&self, name: impl AsRef<OsStr>) -> Result<PathBuf> {
        let name = name.as_ref();
        let results = self.environment.search_for_executables(name, &self.directory);
        match results.first() {
            Some(path) => Ok(path.to_path_buf()),
            None => {
                debug!(name = %name.to_string_lossy(), log = ?results.log, "which.not_found");
                Err(ShellError::ExecutableNotFound(
                    name.to_string_lossy().into_owned(),
                ))
            }
        }
    }

    /// Launch `executable` with this shell's directory, environment and
    /// streams, without waiting for it.
    pub async fn launch(
        &self,
        executable: impl Into<PathBuf>,
        arguments: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Result<RunningProcess> {
        let input = self.input.resolve()?;
        let output = self.output.resolve(&self.context).await?;
        let error = self.error.resolve(&self.context).await?;

        let mut request = SpawnRequest::new(self.directory.join(executable.into()), &self.directory);
        request.arguments = arguments.into_iter().map(Into::into).collect();
        request.environment = self.environment.strings();

        let streams = StandardStreams {
            input: input.as_fd(),
            output: output.as_fd(),
            error: error.as_fd(),
        };
        Process::launch(&self.context, request, streams, &self.kill_signal).await
    }

    /// Run `executable` to completion.
    pub async fn execute(
        &self,
        executable: impl Into<PathBuf>,
        arguments: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Result<()> {
        self.launch(executable, arguments).await?.wait().await
    }

    /// Run an in-process builtin with channels over this shell's streams.
    pub async fn builtin<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Channels) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.kill_signal.aborted_with().is_some() {
            return Err(crate::error::TerminationError::Cancelled.into());
        }
        let input = self.input.resolve()?;
        let chunk_size = self.context.config().chunk_size();
        let channels = Channels {
            input: BuiltinInput::new(InputStream::open(
                input.as_fd(),
                input.registration(),
                chunk_size,
            )?),
            output: self.builtin_output(self.output).await?,
            error: self.builtin_output(self.error).await?,
        };
        // The channel holds its own copy; the temporary can close now.
        drop(input);

        // A shell error propagated through the builtin keeps its identity.
        body(channels)
            .await
            .map_err(|error| match error.downcast::<ShellError>() {
                Ok(shell_error) => shell_error,
                Err(error) => ShellError::Builtin(error),
            })
    }

    async fn builtin_output(&self, output: Output) -> Result<BuiltinOutput> {
        if output == Output::NullDevice {
            // Discarded in-process; the shared device is left alone.
            return Ok(BuiltinOutput::from_writer(Box::new(tokio::io::sink())));
        }
        let resolved = output.resolve(&self.context).await?;
        Ok(BuiltinOutput::open(
            resolved.as_fd(),
            resolved.registration(),
        )?)
    }
}

// ============================================================================
// Tests
// ============================================================================
