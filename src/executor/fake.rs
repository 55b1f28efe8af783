//! In-memory executor for testing
//!
//! Records every invocation in order, keeps a tiny file system so files
//! written through the executor can be read back, and answers commands from
//! scripted responses.

use super::{ExecResult, Executor, ExecutorError, RunOptions, quote_command};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One recorded interaction with the fake instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run { argv: Vec<String>, options: RunOptions },
    WriteFile { path: String, content: Vec<u8>, mode: u32 },
    ReadFile { path: String },
    RemoveFile { path: String },
}

/// Executor-level failure to inject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeFailure {
    Connection(String),
    Spawn(String),
    Timeout(Duration),
}

impl FakeFailure {
    fn to_error(&self, command: String) -> ExecutorError {
        match self {
            Self::Connection(message) => ExecutorError::Connection(message.clone()),
            Self::Spawn(message) => ExecutorError::Spawn {
                command,
                message: message.clone(),
            },
            Self::Timeout(timeout) => ExecutorError::Timeout {
                command,
                timeout: *timeout,
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Response {
    Exit {
        code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    Fail(FakeFailure),
}

#[derive(Debug)]
struct Rule {
    prefix: Vec<String>,
    /// Consumed front to back; the last response repeats forever
    responses: VecDeque<Response>,
    delay: Option<Duration>,
}

impl Rule {
    fn next_response(&mut self) -> Option<Response> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
struct State {
    invocations: Vec<Invocation>,
    files: BTreeMap<String, Vec<u8>>,
    rules: Vec<Rule>,
    read_failure: Option<FakeFailure>,
    write_failure: Option<FakeFailure>,
}

/// Scriptable test double for [`Executor`]
///
/// Clones share state, so a test can hand one clone to the code under test
/// and inspect another afterwards.
///
/// # Example
/// ```
/// use buildbase_rs::executor::FakeExecutor;
///
/// let fake = FakeExecutor::new()
///     .with_response(&["systemctl", "is-system-running"], 0, "running\n", "")
///     .with_file("/etc/os-release", "ID=ubuntu\nVERSION_ID=\"20.04\"\n");
/// assert!(fake.file("/etc/os-release").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<State>>,
}

impl FakeExecutor {
    /// Every command succeeds with empty output unless scripted otherwise
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded calls
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_rule(&self, prefix: &[&str], responses: Vec<Response>, delay: Option<Duration>) {
        self.state().rules.push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            responses: responses.into(),
            delay,
        });
    }

    /// Answer commands starting with `prefix`
    ///
    /// Later rules take precedence over earlier ones.
    pub fn with_response(self, prefix: &[&str], code: i32, stdout: &str, stderr: &str) -> Self {
        self.push_rule(
            prefix,
            vec![Response::Exit {
                code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            }],
            None,
        );
        self
    }

    /// Answer successive matching commands with successive stdout values
    /// (exit code 0); the last one repeats
    pub fn with_stdout_sequence(self, prefix: &[&str], outputs: &[&str]) -> Self {
        let responses = outputs
            .iter()
            .map(|out| Response::Exit {
                code: 0,
                stdout: out.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
            .collect();
        self.push_rule(prefix, responses, None);
        self
    }

    /// Answer successive matching commands with successive exit codes; the
    /// last one repeats
    pub fn with_exit_sequence(self, prefix: &[&str], codes: &[i32]) -> Self {
        let responses = codes
            .iter()
            .map(|code| Response::Exit {
                code: *code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
            .collect();
        self.push_rule(prefix, responses, None);
        self
    }

    /// Fail matching commands at the executor level
    pub fn with_failure(self, prefix: &[&str], failure: FakeFailure) -> Self {
        self.push_rule(prefix, vec![Response::Fail(failure)], None);
        self
    }

    /// Fail the first `count` matching commands, then succeed
    pub fn with_failures_then_success(self, prefix: &[&str], failure: FakeFailure, count: usize) -> Self {
        let mut responses: Vec<Response> = (0..count).map(|_| Response::Fail(failure.clone())).collect();
        responses.push(Response::Exit {
            code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        });
        self.push_rule(prefix, responses, None);
        self
    }

    /// Make matching commands take `delay` before succeeding
    pub fn with_delay(self, prefix: &[&str], delay: Duration) -> Self {
        self.push_rule(
            prefix,
            vec![Response::Exit {
                code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }],
            Some(delay),
        );
        self
    }

    /// Seed a file in the fake instance
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.state()
            .files
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    /// Make every file read fail at the executor level
    pub fn with_read_failure(self, failure: FakeFailure) -> Self {
        self.state().read_failure = Some(failure);
        self
    }

    /// Make every file write or removal fail at the executor level
    pub fn with_write_failure(self, failure: FakeFailure) -> Self {
        self.state().write_failure = Some(failure);
        self
    }

    /// All interactions so far, in order
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state().invocations.clone()
    }

    /// Argv of every `run` call so far, in order
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state()
            .invocations
            .iter()
            .filter_map(|inv| match inv {
                Invocation::Run { argv, .. } => Some(argv.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether any `run` call started with `prefix`
    pub fn ran(&self, prefix: &[&str]) -> bool {
        self.commands().iter().any(|argv| starts_with(argv, prefix))
    }

    /// Current content of a file in the fake instance
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn file_string(&self, path: &str) -> Option<String> {
        self.file(path)
            .map(|content| String::from_utf8_lossy(&content).into_owned())
    }

    /// Paths written so far, in order
    pub fn written_paths(&self) -> Vec<String> {
        self.state()
            .invocations
            .iter()
            .filter_map(|inv| match inv {
                Invocation::WriteFile { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }
}

fn starts_with<S: AsRef<str>>(argv: &[String], prefix: &[S]) -> bool {
    argv.len() >= prefix.len()
        && argv
            .iter()
            .zip(prefix)
            .all(|(arg, expected)| arg == expected.as_ref())
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn run(
        &self,
        argv: &[String],
        options: &RunOptions,
    ) -> Result<ExecResult, ExecutorError> {
        let (response, delay) = {
            let mut state = self.state();
            state.invocations.push(Invocation::Run {
                argv: argv.to_vec(),
                options: options.clone(),
            });
            match state
                .rules
                .iter_mut()
                .rev()
                .find(|rule| starts_with(argv, &rule.prefix))
            {
                Some(rule) => (rule.next_response(), rule.delay),
                None => (None, None),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match response {
            Some(Response::Exit {
                code,
                stdout,
                stderr,
            }) => Ok(ExecResult {
                exit_code: code,
                stdout: if options.capture_output { stdout } else { Vec::new() },
                stderr: if options.capture_output { stderr } else { Vec::new() },
            }),
            Some(Response::Fail(failure)) => Err(failure.to_error(quote_command(argv))),
            None => Ok(ExecResult::default()),
        }
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), ExecutorError> {
        let mut state = self.state();
        state.invocations.push(Invocation::WriteFile {
            path: path.to_string(),
            content: content.to_vec(),
            mode,
        });
        if let Some(failure) = &state.write_failure {
            return Err(failure.to_error(format!("write {path}")));
        }
        state.files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ExecutorError> {
        let mut state = self.state();
        state.invocations.push(Invocation::ReadFile {
            path: path.to_string(),
        });
        if let Some(failure) = &state.read_failure {
            return Err(failure.to_error(format!("read {path}")));
        }
        Ok(state.files.get(path).cloned())
    }

    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError> {
        let mut state = self.state();
        state.invocations.push(Invocation::RemoveFile {
            path: path.to_string(),
        });
        if let Some(failure) = &state.write_failure {
            return Err(failure.to_error(format!("remove {path}")));
        }
        state.files.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::to_argv;

    #[tokio::test]
    async fn test_default_response_is_success() {
        let fake = FakeExecutor::new();
        let result = fake.run(&to_argv(&["true"]), &RunOptions::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(fake.commands(), vec![to_argv(&["true"])]);
    }

    #[tokio::test]
    async fn test_later_rules_take_precedence() {
        let fake = FakeExecutor::new()
            .with_response(&["apt-get"], 0, "", "")
            .with_response(&["apt-get", "install"], 100, "", "E: failed");

        let update = fake
            .run(&to_argv(&["apt-get", "update"]), &RunOptions::new())
            .await
            .unwrap();
        let install = fake
            .run(&to_argv(&["apt-get", "install", "git"]), &RunOptions::new())
            .await
            .unwrap();

        assert_eq!(update.exit_code, 0);
        assert_eq!(install.exit_code, 100);
        assert_eq!(install.stderr_str(), "E: failed");
    }

    #[tokio::test]
    async fn test_stdout_sequence_repeats_last() {
        let fake = FakeExecutor::new().with_stdout_sequence(&["probe"], &["starting", "running"]);
        let argv = to_argv(&["probe"]);

        let outputs = [
            fake.run(&argv, &RunOptions::new()).await.unwrap().stdout_str(),
            fake.run(&argv, &RunOptions::new()).await.unwrap().stdout_str(),
            fake.run(&argv, &RunOptions::new()).await.unwrap().stdout_str(),
        ];
        assert_eq!(outputs, ["starting", "running", "running"]);
    }

    #[tokio::test]
    async fn test_files_round_trip() {
        let fake = FakeExecutor::new();
        assert_eq!(fake.read_file("/etc/x").await.unwrap(), None);

        fake.write_file("/etc/x", b"data", 0o644).await.unwrap();
        assert_eq!(fake.read_file("/etc/x").await.unwrap(), Some(b"data".to_vec()));

        fake.remove_file("/etc/x").await.unwrap();
        assert_eq!(fake.file("/etc/x"), None);
        assert_eq!(fake.written_paths(), vec!["/etc/x".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let fake = FakeExecutor::new()
            .with_failure(&["lxc"], FakeFailure::Connection("socket closed".into()))
            .with_write_failure(FakeFailure::Connection("socket closed".into()));

        let err = fake.run(&to_argv(&["lxc", "exec"]), &RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Connection(_)));

        let err = fake.write_file("/etc/x", b"", 0o644).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Connection(_)));
        assert_eq!(fake.file("/etc/x"), None);
    }
}
