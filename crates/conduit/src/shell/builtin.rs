//! Builtins
//!
//! A builtin is an in-process function that behaves like a command with
//! respect to its channels. [`builtin`] turns any async function over
//! [`Channels`] into an [`Operation`]; [`read_file`] and [`write_file`] are
//! the file builtins.

use std::future::Future;
use std::path::PathBuf;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::pipeline::Operation;
use super::types::Shell;
use crate::channel::Channels;
use crate::error::Result;

/// An operation running an in-process function.
pub struct Builtin<F> {
    body: F,
}

impl<F> std::fmt::Debug for Builtin<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builtin").finish_non_exhaustive()
    }
}

/// Wrap `body` as an operation.
///
/// `body` receives the stage's channels and must flush what it writes.
pub fn builtin<F, Fut, T>(body: F) -> Builtin<F>
where
    F: FnOnce(Channels) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    Builtin { body }
}

impl<F, Fut, T> Operation for Builtin<F>
where
    F: FnOnce(Channels) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn run(self, shell: Shell) -> BoxFuture<'static, Result<T>> {
        async move { shell.builtin(self.body).await }.boxed()
    }
}

// ============================================================================
// File builtins
// ============================================================================

/// Copies a file to the stage's output.
#[derive(Debug, Clone)]
pub struct ReadFile {
    path: PathBuf,
}

/// Read the file at `path`, relative to the running shell's directory.
pub fn read_file(path: impl Into<PathBuf>) -> ReadFile {
    ReadFile { path: path.into() }
}

impl Operation for ReadFile {
    type Output = ();

    fn run(self, shell: Shell) -> BoxFuture<'static, Result<()>> {
        async move {
            let path = shell.directory().join(&self.path);
            let chunk_size = shell.context().config().chunk_size();
            shell
                .builtin(|mut channels| async move {
                    // tokio::fs runs file I/O on the blocking pool.
                    let mut file = tokio::fs::File::open(&path).await?;
                    let mut buf = vec![0u8; chunk_size];
                    loop {
                        let n = file.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        channels.output.write_bytes(&buf[..n]);
                        channels.output.flush().await?;
                    }
                    Ok(())
                })
                .await
        }
        .boxed()
    }
}

/// Writes the stage's input to a file.
#[derive(Debug, Clone)]
pub struct WriteFile {
    path: PathBuf,
    append: bool,
}

/// Write the stage's input to `path` (relative to the running shell's
/// directory), creating it with mode 0644. Truncates unless `append`.
pub fn write_file(path: impl Into<PathBuf>, append: bool) -> WriteFile {
    WriteFile {
        path: path.into(),
        append,
    }
}

impl Operation for WriteFile {
    type Output = ();

    fn run(self, shell: Shell) -> BoxFuture<'static, Result<()>> {
        async move {
            let path = shell.directory().join(&self.path);
            let append = self.append;
            shell
                .builtin(|mut channels| async move {
                    let mut file = tokio::fs::OpenOptions::new()
                        .write(true)
                        .create(true)
                        .append(append)
                        .truncate(!append)
                        .mode(0o644)
                        .open(&path)
                        .await?;
                    let mut input = channels.input.chunks()?;
                    while let Some(chunk) = input.next_chunk().await? {
                        file.write_all(&chunk).await?;
                    }
                    file.flush().await?;
                    Ok(())
                })
                .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::shell::environment::Environment;
    use crate::shell::pipeline::OperationExt;

    fn shell_in(directory: &std::path::Path) -> Shell {
        Shell::new(
            Context::default().shared(),
            directory.to_path_buf(),
            Environment::from_pairs([("PATH", "/usr/bin:/bin")]),
        )
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let shell = shell_in(dir.path());

        let hello = builtin(|mut channels| async move {
            channels.output.write_line("hello").await?;
            Ok(())
        });
        shell.run(hello.pipe(write_file("out.txt", false))).await.unwrap();

        let again = builtin(|mut channels| async move {
            channels.output.write_line("again").await?;
            Ok(())
        });
        shell.run(again.pipe(write_file("out.txt", true))).await.unwrap();

        let text = shell.capture(read_file("out.txt")).await.unwrap();
        assert_eq!(text, "hello\nagain\n");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("out.txt"))
            .unwrap()
            .permissions()
            .mode();
        // Owner read/write and nothing executable; the umask may only clear
        // the group and other read bits.
        assert_eq!(mode & 0o700, 0o600);
        assert_eq!(mode & 0o133, 0);
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = shell_in(dir.path()).capture(read_file("missing")).await;
        assert!(result.is_err());
    }
}
