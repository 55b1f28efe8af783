//! LXD executor - runs commands inside an existing LXD instance via `lxc exec`

use super::{ExecResult, Executor, ExecutorError, HostExecutor, RunOptions, quote_command};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Messages `lxc` prints when it cannot reach the instance at all
const UNREACHABLE_MARKERS: &[&str] = &[
    "Error: Instance not found",
    "Error: Instance is not running",
    "Error: Failed to connect",
    "Error: Get \"http://unix.socket",
];

/// Exit status of the `lxc` client when it fails before running anything
const LXC_CLIENT_ERROR_EXIT: i32 = 1;

/// Whether `result` is the `lxc` client failing to reach the instance
///
/// The client prints a single `Error: ...` line and exits 1. Anything else,
/// including the same text among other output, came from the command.
fn is_unreachable(result: &ExecResult) -> bool {
    let stderr = result.stderr_str();
    let stderr = stderr.trim();
    result.exit_code == LXC_CLIENT_ERROR_EXIT
        && !stderr.contains('\n')
        && UNREACHABLE_MARKERS.iter().any(|marker| stderr.starts_with(marker))
}

/// Executor bound to one LXD instance
///
/// The instance must already exist and be running; this type only issues
/// `lxc exec` through an inner executor (the host by default).
#[derive(Debug, Clone)]
pub struct LxdExecutor<E = HostExecutor> {
    instance: String,
    project: String,
    remote: String,
    lxc: String,
    inner: E,
}

impl LxdExecutor<HostExecutor> {
    /// Executor for `instance` in the default project on the local remote
    pub fn new(instance: impl Into<String>) -> Self {
        Self::with_inner(instance, HostExecutor::new())
    }
}

impl<E: Executor> LxdExecutor<E> {
    /// Use a custom executor to run the `lxc` client
    /// Issue `lxc` through `inner` instead of the host
    pub fn with_inner(instance: impl Into<String>, inner: E) -> Self {
        Self {
            instance: instance.into(),
            project: "default".to_string(),
            remote: "local".to_string(),
            lxc: "lxc".to_string(),
            inner,
        }
    }

    /// Set the LXD project
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Set the LXD remote
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Path of the `lxc` client binary
    pub fn with_lxc_path(mut self, lxc: impl Into<String>) -> Self {
        self.lxc = lxc.into();
        self
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Build the `lxc exec` command line for `argv`
    pub fn exec_command(&self, argv: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
        let mut command = vec![
            self.lxc.clone(),
            "--project".to_string(),
            self.project.clone(),
            "exec".to_string(),
            format!("{}:{}", self.remote, self.instance),
        ];
        for (key, value) in env {
            command.push("--env".to_string());
            command.push(format!("{key}={value}"));
        }
        command.push("--".to_string());
        command.extend(argv.iter().cloned());
        command
    }
}

#[async_trait]
impl<E: Executor> Executor for LxdExecutor<E> {
    async fn run(
        &self,
        argv: &[String],
        options: &RunOptions,
    ) -> Result<ExecResult, ExecutorError> {
        let command = self.exec_command(argv, &options.env);
        // The environment travels as --env flags; the lxc client itself
        // runs with the caller's environment.
        let host_options = RunOptions {
            env: BTreeMap::new(),
            capture_output: true,
            ..options.clone()
        };

        let result = self.inner.run(&command, &host_options).await?;

        if is_unreachable(&result) {
            let stderr = result.stderr_str();
            debug!("lxc could not reach {}: {}", self.instance, stderr.trim());
            return Err(ExecutorError::Connection(format!(
                "{} ({}): {}",
                self.instance,
                quote_command(argv),
                stderr.trim()
            )));
        }

        if options.capture_output {
            Ok(result)
        } else {
            Ok(ExecResult {
                exit_code: result.exit_code,
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FakeExecutor, to_argv};

    #[test]
    fn test_exec_command() {
        let executor = LxdExecutor::new("buildd-focal")
            .with_project("craft")
            .with_remote("local");
        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "C.UTF-8".to_string());

        let command = executor.exec_command(&to_argv(&["apt-get", "update"]), &env);
        assert_eq!(
            command,
            to_argv(&[
                "lxc",
                "--project",
                "craft",
                "exec",
                "local:buildd-focal",
                "--env",
                "LANG=C.UTF-8",
                "--",
                "apt-get",
                "update",
            ])
        );
    }

    #[tokio::test]
    async fn test_run_goes_through_inner_executor() {
        let fake = FakeExecutor::new();
        let executor = LxdExecutor::with_inner("itest", fake.clone());

        let result = executor
            .run(&to_argv(&["true"]), &RunOptions::new())
            .await
            .unwrap();
        assert!(result.success());

        let calls = fake.commands();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            to_argv(&["lxc", "--project", "default", "exec", "local:itest", "--", "true"])
        );
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_connection_error() {
        let fake = FakeExecutor::new().with_response(
            &["lxc"],
            1,
            "",
            "Error: Instance not found\n",
        );
        let executor = LxdExecutor::with_inner("missing", fake);

        let err = executor
            .run(&to_argv(&["true"]), &RunOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Connection(_)));
    }

    #[tokio::test]
    async fn test_command_output_resembling_lxc_errors_is_not_unreachable() {
        let executor = |code: i32, stderr: &str| {
            LxdExecutor::with_inner(
                "itest",
                FakeExecutor::new().with_response(&["lxc"], code, "", stderr),
            )
        };
        let argv = to_argv(&["curl", "http://mirror"]);

        let result = executor(7, "Error: Failed to connect to mirror\n")
            .run(&argv, &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);

        let result = executor(1, "fetching\nError: Failed to connect to mirror\n")
            .run(&argv, &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_command_failure_is_returned_as_exit_code() {
        let fake = FakeExecutor::new().with_response(&["lxc"], 100, "", "E: Unable to locate package\n");
        let executor = LxdExecutor::with_inner("itest", fake);

        let result = executor
            .run(&to_argv(&["apt-get", "install", "nope"]), &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 100);
    }
}
