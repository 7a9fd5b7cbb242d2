//! Running external database utilities with a wall-clock timeout and a
//! bounded stderr capture.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum number of stderr bytes kept from a child process (10 MiB)
pub const MAX_STDERR_BYTES: u64 = 10 * 1024 * 1024;

/// Output of a finished child process
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    /// Captured stderr, truncated to the configured limit
    pub stderr: String,
}

/// Why a child process did not produce an output
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Spawn `command` and wait for it to exit, killing it once `timeout` elapses.
///
/// Stdout is discarded. Stderr is drained for the whole lifetime of the child
/// so a chatty process never blocks on a full pipe, but only the first
/// `stderr_limit` bytes are kept.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    stderr_limit: u64,
) -> Result<ProcessOutput, ProcessError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, stderr_limit)));

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let status = match waited {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => return Err(ProcessError::Wait { program, source }),
        Err(_) => {
            let _ = child.kill().await;
            return Err(ProcessError::TimedOut { program, timeout });
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(ProcessOutput {
        status,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: u64) -> Vec<u8> {
    let mut captured = Vec::new();
    let _ = (&mut reader).take(limit).read_to_end(&mut captured).await;
    // Keep draining so the child never blocks writing to a full pipe.
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    captured
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn test_captures_status_and_stderr() {
        let output = run_with_timeout(shell("echo warning >&2; exit 3"), Duration::from_secs(10), MAX_STDERR_BYTES)
            .await
            .unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr.trim(), "warning");
    }

    #[tokio::test]
    async fn test_stderr_is_truncated_to_limit() {
        let output = run_with_timeout(
            shell("for i in 1 2 3 4 5 6 7 8 9 10; do echo 0123456789 >&2; done"),
            Duration::from_secs(10),
            16,
        )
        .await
        .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stderr.len(), 16);
    }

    #[tokio::test]
    async fn test_times_out() {
        let err = run_with_timeout(shell("sleep 5"), Duration::from_millis(100), MAX_STDERR_BYTES)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let err = run_with_timeout(
            Command::new("/nonexistent/pg_dump"),
            Duration::from_secs(1),
            MAX_STDERR_BYTES,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
