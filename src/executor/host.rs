//! Host executor - runs commands directly on the local machine

use super::{ExecResult, Executor, ExecutorError, RunOptions, quote_command};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Executor for the machine this process runs on
///
/// Commands are wrapped in `sudo -H -u <user>` when a sudo user is set.
/// Children are killed when the running future is dropped, so cancelling a
/// provisioning session never leaves a command running behind it.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    sudo_user: Option<String>,
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostExecutor {
    /// Run commands as the current user
    pub fn new() -> Self {
        Self { sudo_user: None }
    }

    /// Run commands as `user` through sudo
    pub fn with_sudo_user(user: impl Into<String>) -> Self {
        Self {
            sudo_user: Some(user.into()),
        }
    }

    pub fn sudo_user(&self) -> Option<&str> {
        self.sudo_user.as_deref()
    }

    /// Final argv, including the sudo prefix when configured
    ///
    /// sudo resets the environment of the command it runs, so under sudo
    /// `env` is passed through `env K=V` after the prefix.
    pub fn prepare_command(&self, argv: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
        let mut command = Vec::with_capacity(argv.len() + env.len() + 5);
        if let Some(user) = &self.sudo_user {
            command.extend(["sudo", "-H", "-u", user.as_str()].map(String::from));
            if !env.is_empty() {
                command.push("env".to_string());
                command.extend(env.iter().map(|(key, value)| format!("{key}={value}")));
            }
        }
        command.extend(argv.iter().cloned());
        command
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn run(
        &self,
        argv: &[String],
        options: &RunOptions,
    ) -> Result<ExecResult, ExecutorError> {
        let command = self.prepare_command(argv, &options.env);
        let quoted = quote_command(&command);
        let Some((program, args)) = command.split_first() else {
            return Err(ExecutorError::Spawn {
                command: quoted,
                message: "empty command".to_string(),
            });
        };

        debug!("Executing: {}", quoted);

        let output_stdio = || {
            if options.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(&options.env)
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(output_stdio())
            .stderr(output_stdio())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn {
                command: quoted.clone(),
                message: e.to_string(),
            })?;

        if let Some(input) = &options.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            let input = input.clone();
            // Written from a separate task so a chatty child cannot deadlock
            // on a full stdout pipe while we are still feeding stdin.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Failed to write stdin: {}", e);
                }
            });
        }

        let output = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| ExecutorError::Timeout {
                    command: quoted.clone(),
                    timeout,
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
