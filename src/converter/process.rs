//! Cancellable execution of external conversion tools.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ConvertError;

/// How often a running child is polled for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit status and captured stderr of a finished tool.
#[derive(Debug)]
pub(crate) struct ToolRun {
    pub status: ExitStatus,
    pub stderr: String,
}

impl ToolRun {
    pub fn into_failure(self, tool: &'static str) -> ConvertError {
        let stderr = self.stderr.trim();
        ConvertError::ToolFailed {
            tool,
            status: self.status.to_string(),
            stderr: if stderr.is_empty() {
                "unknown error".to_string()
            } else {
                stderr.to_string()
            },
        }
    }
}

/// Resolves a tool binary: the configured path if it exists, else a PATH
/// lookup.
pub(crate) fn locate_tool(name: &str, configured: Option<&Path>) -> Result<PathBuf, ConvertError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        warn!(tool = name, path = %path.display(), "Configured tool path does not exist, trying PATH");
    }

    which::which(name).map_err(|_| {
        ConvertError::ToolUnavailable(format!(
            "{name} not found; install it or configure its path"
        ))
    })
}

/// Runs `command` to completion, killing it if `cancel` fires first.
///
/// A non-zero exit status is returned to the caller, which knows how to
/// classify the tool's exit codes.
pub(crate) fn run_tool(
    tool: &'static str,
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<ToolRun, ConvertError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    debug!(tool, command = ?command, "Spawning conversion tool");

    let mut child = command.spawn().map_err(|err| match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            ConvertError::ToolUnavailable(format!("failed to start {tool}: {err}"))
        }
        _ => ConvertError::Io(err),
    })?;

    // Drain stderr on its own thread so a chatty tool cannot fill the pipe.
    let stderr = child.stderr.take();
    let reader = thread::spawn(move || {
        let mut captured = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut captured);
        }
        captured
    });

    loop {
        if cancel.is_cancelled() {
            warn!(tool, pid = child.id(), "Cancellation requested, killing conversion tool");
            let _ = child.kill();
            let _ = child.wait();
            let _ = reader.join();
            return Err(ConvertError::Cancelled);
        }

        match child.try_wait()? {
            Some(status) => {
                let stderr = reader.join().unwrap_or_default();
                debug!(tool, %status, "Conversion tool exited");
                return Ok(ToolRun { status, stderr });
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}
