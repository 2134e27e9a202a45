use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::retry::is_retryable_message;

/// Captured output of a successful CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Failure of an external CLI call.
///
/// The raw stdout/stderr is kept so callers can surface it as diagnostic
/// detail instead of a generic message.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("{program} exited with {status}: {}", first_line(.stderr, .stdout))]
    Failed {
        program: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

impl CliError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "cli_spawn",
            Self::Timeout { .. } => "cli_timeout",
            Self::Failed { .. } => "cli_failed",
        }
    }

    /// Timeouts and known transient failures (rate limits, gateway errors,
    /// connection resets) are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::Timeout { .. } => true,
            Self::Failed { stdout, stderr, .. } => {
                is_retryable_message(stderr) || is_retryable_message(stdout)
            }
        }
    }

    /// Combined stderr/stdout of a failed command.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Failed { stdout, stderr, .. } => {
                let mut out = stderr.trim().to_string();
                if !stdout.trim().is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(stdout.trim());
                }
                Some(out)
            }
            _ => None,
        }
    }
}

fn first_line<'a>(stderr: &'a str, stdout: &'a str) -> &'a str {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    source.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

/// Run `program args...` in `cwd`, failing once `timeout` elapses.
///
/// The child is killed if the timeout fires.
pub async fn run_cli(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<CliOutput, CliError> {
    debug!(program, ?args, cwd = %cwd.display(), "running cli");

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CliError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })
        }
        Err(_) => {
            return Err(CliError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok(CliOutput { stdout, stderr })
    } else {
        Err(CliError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = run_cli(
            "swarmyard-definitely-not-installed",
            &[],
            Path::new("."),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "cli_spawn");
        assert!(!err.is_retryable());
    }

    #[test]
    fn failed_output_is_preserved() {
        let err = CliError::Failed {
            program: "gh".into(),
            status: "exit status: 1".into(),
            stdout: "partial".into(),
            stderr: "HTTP 502: Bad Gateway\nmore".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.detail().unwrap(), "HTTP 502: Bad Gateway\nmore\npartial");
        assert!(err.to_string().ends_with("HTTP 502: Bad Gateway"));
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = CliError::Timeout {
            program: "bd".into(),
            secs: 30,
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), "cli_timeout");
    }
}
