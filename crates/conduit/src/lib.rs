//! Process orchestration for async Rust
//!
//! Spawns external executables and in-process builtins, wires their
//! standard streams together through OS pipes, and composes them into
//! pipelines that behave the same whichever kind of stage they contain.
//!
//! ```ignore
//! use conduit::{Command, Context, OperationExt, Shell};
//!
//! let shell = Shell::from_process(Context::default().shared())?;
//! let text = shell
//!     .capture(Command::new("echo").arg("Foo").pipe(Command::new("sed").arg("s/Foo/Bar/")))
//!     .await?;
//! assert_eq!(text, "Bar\n");
//! ```
//!
//! ## Layout
//!
//! - [`fd`] - pipes and descriptor duplication
//! - [`context`] - shared services, including the null output device
//! - [`channel`] - builtin input/output channels
//! - [`process`] - spawning, monitoring, reaping, cancellation
//! - [`shell`] - shell values, operations, pipe composition, builtins
//!
//! Everything runs on tokio. Processes are monitored through a pipe whose
//! last copy closes when the process exits, so no thread ever blocks in
//! `waitpid`.

#[cfg(not(unix))]
compile_error!("conduit supports unix platforms only");

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod fd;
pub mod process;
pub mod shell;

pub use channel::{BuiltinInput, BuiltinOutput, Channels, InputStream, Segments};
pub use config::ContextConfig;
pub use context::Context;
pub use error::{ChannelError, Result, ShellError, SpawnError, TerminationError};
pub use process::wait::ExitStatus;
pub use process::{Process, ProcessId, ProcessLogger, RunningProcess, TracingProcessLogger};
pub use shell::{
    builtin, pipe, pipe_error, read_file, write_file, Command, Environment, Input, KillSignal,
    Operation, OperationExt, Output, Shell, SignalKind,
};
