//! Shell values and pipeline composition
//!
//! - `types` - `Shell`, `Input`, `Output`
//! - `signal` - hierarchical kill signals
//! - `environment` / `which` - environment entries and PATH search
//! - `pipeline` - `Operation`, `Command`, `pipe`
//! - `builtin` - in-process operations

pub mod builtin;
pub mod environment;
pub mod pipeline;
pub mod signal;
pub mod types;
pub mod which;

pub use builtin::{builtin, read_file, write_file, Builtin, ReadFile, WriteFile};
pub use environment::Environment;
pub use pipeline::{pipe, pipe_error, Command, Operation, OperationExt, PipedStream, Pipeline};
pub use signal::{KillSignal, KillSignalDropGuard, SignalKind};
pub use types::{Input, Output, Shell};
pub use which::{SearchEvent, SearchResults};
