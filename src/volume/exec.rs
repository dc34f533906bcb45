//! Child process invocation for the storage command line tools.
//!
//! Every child runs in its own process group so that an expired timeout can
//! take the whole group down with one SIGKILL. A child that died from SIGKILL
//! is reported as a timeout, not a command failure.

use crate::error::{Error, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::error;

/// Default timeout of external tools.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout of the slow image-walking commands, `rbd du` and `rbd diff`.
pub const LONG_CMD_TIMEOUT: Duration = Duration::from_secs(300);

/// Run a command with the default timeout and return its stdout.
pub async fn exec_command(program: &str, args: &[String]) -> Result<Vec<u8>> {
    exec_with_timeout(DEFAULT_CMD_TIMEOUT, program, args).await
}

/// Run a command with an explicit timeout and return its stdout.
pub async fn exec_with_timeout(
    timeout: Duration,
    program: &str,
    args: &[String],
) -> Result<Vec<u8>> {
    let command_display = format!("{} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let child = command.spawn().map_err(|source| Error::CommandSpawn {
        command: command_display.clone(),
        source,
    })?;
    let pid = child.id();

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(waited) => waited.map_err(|source| Error::CommandSpawn {
            command: command_display.clone(),
            source,
        })?,
        Err(_) => {
            if let Some(pid) = pid {
                if let Err(errno) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    error!(command = %command_display, %errno, "kill process group failed");
                }
            }
            return Err(Error::CommandTimeout { command: command_display });
        }
    };

    if output.status.success() {
        return Ok(output.stdout);
    }
    if output.status.signal() == Some(Signal::SIGKILL as i32) {
        return Err(Error::CommandTimeout { command: command_display });
    }
    Err(Error::CommandFailed {
        command: command_display,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        code: output.status.code(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let output = exec_command("echo", &["hello".to_string()]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output).trim(), "hello");
    }

    #[tokio::test]
    async fn reports_exit_code_and_stderr() {
        let args = ["-c".to_string(), "echo broken >&2; exit 3".to_string()];
        match exec_command("sh", &args).await {
            Err(Error::CommandFailed { stderr, code, .. }) => {
                assert_eq!(stderr, "broken");
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn kills_slow_commands() {
        let args = ["10".to_string()];
        match exec_with_timeout(Duration::from_millis(100), "sleep", &args).await {
            Err(Error::CommandTimeout { command }) => assert!(command.starts_with("sleep")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
