//! Conduit command-line runner
//!
//! Runs a pipeline of executables and exits with the pipeline's status,
//! following shell conventions (nonzero status passed through, 128 + signal
//! for signal deaths, 127 for commands that were not found).
//!
//! # Usage
//!
//! ```text
//! conduit [--config <path>] [--directory <dir>] <command> [args...] [| <command> [args...]]...
//! ```
//!
//! The `|` separators must be quoted so the invoking shell passes them
//! through, e.g. `conduit echo Foo '|' sed s/Foo/Bar/`.
//!
//! # Configuration
//!
//! Read from `--config <path>`, or `conduit.toml` in the working directory
//! if present:
//!
//! ```toml
//! [context]
//! wait_retry_delay_ms = 1000
//! # max_wait_retries = 30
//! read_chunk_size = 8192
//!
//! [runtime]
//! worker_threads = 1
//! blocking_threads = 6
//! ```
//!
//! # Environment Variables
//!
//! - `CONDUIT_LOG` - Log filter (default: "warn")

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use conduit::{pipe, Command, Context, ContextConfig, Operation, Shell, ShellError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, info};

const DEFAULT_CONFIG_FILE: &str = "conduit.toml";

// ============================================================================
// Configuration
// ============================================================================

/// Contents of `conduit.toml`.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct CliConfig {
    context: ContextConfig,
    runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct RuntimeConfig {
    /// Threads driving the reactor and tasks (default: 1)
    worker_threads: usize,
    /// Threads for blocking file I/O and spawning (default: 6)
    blocking_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            blocking_threads: 6,
        }
    }
}

impl CliConfig {
    fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&text).context("parsing config")
    }
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    directory: Option<PathBuf>,
    stages: Vec<Vec<OsString>>,
}

const USAGE: &str =
    "Usage: conduit [--config <path>] [--directory <dir>] <command> [args...] ['|' <command> [args...]]...";

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter().peekable();

    // Options come before the first command word.
    while let Some(arg) = args.peek() {
        match arg.to_str() {
            Some("--config") => {
                args.next();
                let path = args.next().context("--config requires a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            Some("--directory") => {
                args.next();
                let path = args.next().context("--directory requires a path")?;
                parsed.directory = Some(PathBuf::from(path));
            }
            Some("--") => {
                args.next();
                break;
            }
            _ => break,
        }
    }

    let mut stage = Vec::new();
    for arg in args {
        if arg == "|" {
            anyhow::ensure!(!stage.is_empty(), "empty pipeline stage\n{USAGE}");
            parsed.stages.push(std::mem::take(&mut stage));
        } else {
            stage.push(arg);
        }
    }
    anyhow::ensure!(!stage.is_empty(), "missing command\n{USAGE}");
    parsed.stages.push(stage);
    Ok(parsed)
}

// ============================================================================
// Pipeline
// ============================================================================

/// Commands piped left to right.
struct Stages(Vec<Command>);

impl Operation for Stages {
    type Output = ();

    fn run(self, shell: Shell) -> BoxFuture<'static, conduit::Result<()>> {
        async move {
            let mut commands = self.0.into_iter();
            let Some(first) = commands.next() else {
                return Ok(());
            };
            let rest: Vec<Command> = commands.collect();
            if rest.is_empty() {
                shell.run(first).await
            } else {
                pipe(&shell, first, Stages(rest)).await
            }
        }
        .boxed()
    }
}

fn build_stages(stages: Vec<Vec<OsString>>) -> Stages {
    Stages(
        stages
            .into_iter()
            .map(|mut words| {
                let program = words.remove(0);
                Command::new(program).args(words)
            })
            .collect(),
    )
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("CONDUIT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let code = match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("conduit: {error:#}");
            2
        }
    };
    std::process::exit(code);
}

/// Run the pipeline and return the exit code to use.
fn run() -> Result<i32> {
    let args = parse_args(env::args_os().skip(1))?;
    let config = CliConfig::load(args.config.as_deref())?;
    debug!(?config, "cli.config loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads.max(1))
        .max_blocking_threads(config.runtime.blocking_threads.max(1))
        .enable_all()
        .build()
        .context("creating tokio runtime")?;

    let context = Context::new(config.context).shared();
    let mut shell = Shell::from_process(context.clone()).context("reading working directory")?;
    if let Some(directory) = &args.directory {
        shell = shell.pushing(directory);
    }
    let stages = build_stages(args.stages);

    let result = runtime.block_on(async {
        let run = shell.run(stages);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                info!(live = ?context.live_processes(), "cli.interrupt");
                shell.kill_signal().send_sigterm();
                context.terminate_all();
                // Let every stage reap its processes.
                run.await
            }
        }
    });

    Ok(exit_code(&result))
}

fn exit_code(result: &conduit::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(error) => {
            if !matches!(error, ShellError::Termination(_)) {
                eprintln!("conduit: {error}");
            }
            error.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::TerminationError;
    use pretty_assertions::assert_eq;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_parse_pipeline() {
        let args = parse_args(os(&["--config", "c.toml", "echo", "Foo", "|", "sed", "s/a/b/"]))
            .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("c.toml")));
        assert_eq!(args.stages, vec![os(&["echo", "Foo"]), os(&["sed", "s/a/b/"])]);
    }

    #[test]
    fn test_parse_rejects_empty_stage() {
        assert!(parse_args(os(&["echo", "|", "|", "cat"])).is_err());
        assert!(parse_args(os(&["echo", "|"])).is_err());
        assert!(parse_args(os(&[])).is_err());
    }

    #[test]
    fn test_double_dash_ends_options() {
        let args = parse_args(os(&["--", "--config"])).unwrap();
        assert_eq!(args.config, None);
        assert_eq!(args.stages, vec![os(&["--config"])]);
    }

    #[test]
    fn test_config_defaults() {
        let config: CliConfig = toml::from_str("[runtime]\nblocking_threads = 2\n").unwrap();
        assert_eq!(config.runtime.worker_threads, 1);
        assert_eq!(config.runtime.blocking_threads, 2);
        assert_eq!(config.context, ContextConfig::default());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        let failed = Err(ShellError::from(TerminationError::NonzeroExitStatus(4)));
        assert_eq!(exit_code(&failed), 4);
    }
}
