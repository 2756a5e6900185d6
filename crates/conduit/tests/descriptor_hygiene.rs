//! Descriptor counts stay flat across many pipelines.
//!
//! Lives in its own test binary so no concurrently running test opens or
//! closes descriptors while we count.

use std::path::PathBuf;

use conduit::{
    builtin, Command, Context, ContextConfig, Environment, OperationExt, Output, Shell,
};

const ITERATIONS: usize = 300;

fn open_descriptors() -> usize {
    let dir = if cfg!(target_os = "linux") {
        "/proc/self/fd"
    } else {
        "/dev/fd"
    };
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

async fn exercise(shell: &Shell) {
    // Success: process -> process
    let text = shell
        .capture(Command::new("echo").arg("Foo").pipe(Command::new("sed").arg("s/Foo/Bar/")))
        .await
        .unwrap();
    assert_eq!(text, "Bar\n");

    // Failure in the source
    assert!(shell
        .capture(Command::new("false").pipe(Command::new("cat")))
        .await
        .is_err());

    // Broken pipe from an early-exiting destination
    let flood = builtin(|mut channels| async move {
        let chunk = "y\n".repeat(2048);
        loop {
            if let Err(error) = channels.output.write_all(&chunk).await {
                return Err::<(), anyhow::Error>(error.into());
            }
        }
    });
    let first = shell
        .capture(flood.pipe(Command::new("head").args(["-n", "1"])))
        .await
        .unwrap();
    assert_eq!(first, "y\n");

    // Not found, and output to the null device
    assert!(shell.run(Command::new("nonexistent_command_12345")).await.is_err());
    shell
        .with_output(Output::NullDevice)
        .run(Command::new("echo").arg("discarded"))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptor_count_stays_flat() {
    let config = ContextConfig {
        wait_retry_delay_ms: 10,
        ..Default::default()
    };
    let shell = Shell::new(
        Context::new(config).shared(),
        PathBuf::from("/"),
        Environment::from_pairs([("PATH", "/usr/bin:/bin")]),
    );

    // Warm up lazily created resources (null device, blocking pool).
    exercise(&shell).await;
    let before = open_descriptors();
    assert!(before > 0, "cannot count descriptors on this platform");

    for _ in 0..ITERATIONS {
        exercise(&shell).await;
    }

    let after = open_descriptors();
    assert_eq!(before, after, "descriptors leaked over {ITERATIONS} iterations");
    assert!(shell.context().live_processes().is_empty());
}
