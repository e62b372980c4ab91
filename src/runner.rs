//! Runs one terminal command inside a working clone.
//!
//! The command line is split on whitespace and executed directly, never
//! through a shell. Output is collected as it streams; on timeout the
//! whole process group is killed and whatever arrived so far is returned.

use serde::Serialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Exit code reported when the deadline expires, as with `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const READ_CHUNK: usize = 8 * 1024;

/// Result of [`run`]. Failures are reported here too, never as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandOutput {
    fn failed(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: 1,
            timed_out: false,
        }
    }
}

/// A piece of live output forwarded to streaming callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Split a command line into program and arguments.
pub fn split_command_line(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = line.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// Run `command_line` in `root` with a wall-clock `timeout`.
pub async fn run(root: &Path, command_line: &str, timeout: Duration) -> CommandOutput {
    run_streaming(root, command_line, timeout, None).await
}

/// As [`run`], also forwarding each chunk of output to `sink`.
pub async fn run_streaming(
    root: &Path,
    command_line: &str,
    timeout: Duration,
    sink: Option<&mpsc::UnboundedSender<OutputChunk>>,
) -> CommandOutput {
    let Some((program, args)) = split_command_line(command_line) else {
        return CommandOutput::failed("No command given".to_string());
    };

    info!(command = command_line, root = %root.display(), "Running command");

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .current_dir(root)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "Failed to start command");
            return CommandOutput::failed(format!("Failed to start '{}': {}", program, e));
        }
    };

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child).await;
        return CommandOutput::failed("Failed to capture command output".to_string());
    };

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_bytes = Vec::new();
    let mut err_bytes = Vec::new();
    let (mut out_open, mut err_open) = (true, true);
    let mut timed_out = false;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    forward(sink, OutputChunk::Stdout(String::from_utf8_lossy(&out_buf[..n]).into_owned()));
                    out_bytes.extend_from_slice(&out_buf[..n]);
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    forward(sink, OutputChunk::Stderr(String::from_utf8_lossy(&err_buf[..n]).into_owned()));
                    err_bytes.extend_from_slice(&err_buf[..n]);
                }
            },
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
        }
    }

    let status = if timed_out {
        None
    } else {
        tokio::select! {
            status = child.wait() => status.ok(),
            _ = &mut deadline => {
                timed_out = true;
                None
            }
        }
    };

    let stdout = String::from_utf8_lossy(&out_bytes).into_owned();
    let mut stderr = String::from_utf8_lossy(&err_bytes).into_owned();

    if timed_out {
        terminate(&mut child).await;
        warn!(command = command_line, timeout_ms = timeout.as_millis() as u64, "Command timed out");
        let notice = format!("Command timed out after {}", describe(timeout));
        forward(sink, OutputChunk::Stderr(notice.clone()));
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&notice);
        return CommandOutput {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
        };
    }

    let exit_code = status.map(exit_code_of).unwrap_or(1);
    info!(command = command_line, exit_code, "Command finished");
    CommandOutput {
        stdout,
        stderr,
        exit_code,
        timed_out: false,
    }
}

fn forward(sink: Option<&mpsc::UnboundedSender<OutputChunk>>, chunk: OutputChunk) {
    if let Some(sink) = sink {
        let _ = sink.send(chunk);
    }
}

/// Kill the child's process group, then reap the child.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "killpg failed");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn describe(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} ms", timeout.as_millis())
    }
}
