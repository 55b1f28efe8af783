//! Command execution inside a target instance
//!
//! An [`Executor`] is bound to exactly one instance and is the only way the
//! provisioning code touches it. Implementations decide how commands reach
//! the instance (local process, `lxc exec`, ...); the image logic only sees
//! exit codes and captured output.

pub mod fake;
pub mod host;
pub mod lxd;
pub mod retry;

pub use fake::FakeExecutor;
pub use host::HostExecutor;
pub use lxd::LxdExecutor;
pub use retry::{RetryConfig, RetryingExecutor};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Exit code the `read_file` helper uses to report a missing file
const MISSING_FILE_EXIT: i32 = 100;

/// Failure of the executor itself (as opposed to a command exiting nonzero)
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to start '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Instance unreachable: {0}")]
    Connection(String),

    #[error("Command '{command}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Whether retrying the same command could reasonably succeed
    ///
    /// Timeouts are deliberately excluded: the command may still be running
    /// inside the instance.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Connection(_) | Self::Io(_))
    }
}

/// Per-command execution options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Upper bound for the command's runtime
    pub timeout: Option<Duration>,
    /// Capture stdout/stderr instead of discarding them
    pub capture_output: bool,
    /// Environment variables set for the command
    pub env: BTreeMap<String, String>,
    /// Bytes fed to the command's stdin
    pub stdin: Option<Vec<u8>>,
}

impl RunOptions {
    /// Options that capture output, with no timeout and no extra environment
    pub fn new() -> Self {
        Self {
            capture_output: true,
            ..Default::default()
        }
    }

    /// Set the runtime bound, `None` for unbounded
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set whether stdout and stderr are captured
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Replace the command environment
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Feed `stdin` to the command
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Outcome of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs commands inside one instance
///
/// The executor value is the instance handle: callers never pass instance
/// identifiers around separately. Implementations must not create, start,
/// stop or destroy the instance.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `argv` to completion
    ///
    /// A command that runs and exits nonzero is reported through
    /// [`ExecResult::exit_code`], not as an error.
    async fn run(&self, argv: &[String], options: &RunOptions)
    -> Result<ExecResult, ExecutorError>;

    /// Replace `path` with `content`
    ///
    /// The content lands in a temporary file next to the destination and is
    /// renamed over it, so readers see either the old file or the new one.
    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), ExecutorError> {
        let tmp = format!("{path}.buildbase-tmp");
        let argv = to_argv(&[
            "sh",
            "-c",
            r#"set -e; cat > "$1"; chmod "$3" "$1"; mv -f "$1" "$2""#,
            "sh",
            &tmp,
            path,
            &format!("{mode:04o}"),
        ]);
        let options = RunOptions::new().with_stdin(content);
        let result = self.run(&argv, &options).await?;
        check_result(&argv, result).map(|_| ())
    }

    /// Read `path`, returning `None` if it does not exist
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ExecutorError> {
        let argv = to_argv(&[
            "sh",
            "-c",
            r#"if [ -e "$1" ]; then exec cat "$1"; else exit 100; fi"#,
            "sh",
            path,
        ]);
        let result = self.run(&argv, &RunOptions::new()).await?;
        if result.exit_code == MISSING_FILE_EXIT {
            return Ok(None);
        }
        check_result(&argv, result).map(|r| Some(r.stdout))
    }

    /// Remove `path` if present
    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError> {
        let argv = to_argv(&["rm", "-f", path]);
        let result = self.run(&argv, &RunOptions::new()).await?;
        check_result(&argv, result).map(|_| ())
    }
}

fn check_result(argv: &[String], result: ExecResult) -> Result<ExecResult, ExecutorError> {
    if result.success() {
        Ok(result)
    } else {
        Err(ExecutorError::CommandFailed {
            command: quote_command(argv),
            exit_code: result.exit_code,
            stderr: result.stderr_str().trim().to_string(),
        })
    }
}

/// Convert a slice of string-likes into an owned argv
pub fn to_argv<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter().map(|a| a.as_ref().to_string()).collect()
}

/// Render a command line the way a shell would accept it
pub fn quote_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_command() {
        let argv = to_argv(&["apt-get", "install", "--yes", "git"]);
        assert_eq!(quote_command(&argv), "apt-get install --yes git");

        let argv = to_argv(&["sh", "-c", "echo 'hi' there", ""]);
        assert_eq!(
            quote_command(&argv),
            r#"sh -c 'echo '"'"'hi'"'"' there' ''"#
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(ExecutorError::Connection("gone".into()).is_transient());
        assert!(
            ExecutorError::Spawn {
                command: "lxc".into(),
                message: "not found".into()
            }
            .is_transient()
        );
        assert!(
            !ExecutorError::Timeout {
                command: "sleep 10".into(),
                timeout: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(
            !ExecutorError::CommandFailed {
                command: "cat".into(),
                exit_code: 1,
                stderr: String::new()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_exec_result_helpers() {
        let result = ExecResult {
            exit_code: 0,
            stdout: b"running\n".to_vec(),
            stderr: Vec::new(),
        };
        assert!(result.success());
        assert_eq!(result.stdout_str().trim(), "running");
    }
}
