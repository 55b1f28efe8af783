//! Base image provisioning protocol
//!
//! An [`Image`] supplies an ordered list of [`SetupStep`]s, a readiness probe,
//! a command environment and a compatibility tag. The provided
//! [`Image::setup`] method drives the protocol:
//!
//! 1. Read the compatibility tag record from the instance.
//! 2. If it matches, only probe readiness and return.
//! 3. Otherwise run every step in order, aborting on the first failure.
//! 4. Write the tag once all steps succeeded.
//!
//! Steps must be idempotent: an aborted session leaves the instance without
//! a tag, and the next `setup` simply runs the whole sequence again.
//!
//! A single instance must not be set up by two sessions at once; separate
//! instances are fully independent.

pub mod buildd;
pub mod os_release;
pub mod state;
pub mod tag;

pub use buildd::{BuilddAlias, BuilddConfig, BuilddImage};
pub use state::{ProvisionState, Session};
pub use tag::{DEFAULT_TAG_LOCATION, StoredTag};

use crate::error::{ImageError, StepFailure};
use crate::executor::{ExecResult, Executor, ExecutorError, RunOptions, quote_command, to_argv};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Step name used for the readiness probe of an already provisioned instance
pub const READINESS_STEP: &str = "readiness";

/// When a probe counts as successful
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAccept {
    /// Exit code 0
    ExitSuccess,
    /// Exit code is ignored; trimmed stdout must equal one of these
    StdoutOneOf(Vec<String>),
}

/// A bounded, repeated check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub description: String,
    pub argv: Vec<String>,
    pub accept: ProbeAccept,
    pub timeout: Duration,
    pub interval: Duration,
}

impl Probe {
    /// Probe running `argv`, with a 60 s bound polled every 500 ms
    pub fn new(description: impl Into<String>, argv: &[&str], accept: ProbeAccept) -> Self {
        Self {
            description: description.into(),
            argv: to_argv(argv),
            accept,
            timeout: Duration::from_secs(60),
            interval: Duration::from_millis(500),
        }
    }

    /// Set how long to keep polling before giving up
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn accepts(&self, result: &ExecResult) -> bool {
        match &self.accept {
            ProbeAccept::ExitSuccess => result.success(),
            ProbeAccept::StdoutOneOf(values) => {
                let stdout = result.stdout_str();
                values.iter().any(|v| v == stdout.trim())
            }
        }
    }
}

/// One unit of work inside a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Run a command; any exit code outside 0 and `allowed_exit_codes` fails
    Run {
        argv: Vec<String>,
        allowed_exit_codes: Vec<i32>,
    },
    /// Atomically replace a file
    WriteFile {
        path: String,
        content: Vec<u8>,
        mode: u32,
    },
    /// Poll until the probe succeeds or its timeout elapses
    Wait(Probe),
}

impl StepAction {
    pub fn run(argv: &[&str]) -> Self {
        Self::Run {
            argv: to_argv(argv),
            allowed_exit_codes: Vec::new(),
        }
    }

    pub fn run_args(argv: Vec<String>) -> Self {
        Self::Run {
            argv,
            allowed_exit_codes: Vec::new(),
        }
    }

    /// Run a command that signals "already done" with a nonzero exit code
    pub fn run_allowing(argv: &[&str], allowed_exit_codes: &[i32]) -> Self {
        Self::Run {
            argv: to_argv(argv),
            allowed_exit_codes: allowed_exit_codes.to_vec(),
        }
    }

    pub fn write_file(path: impl Into<String>, content: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self::WriteFile {
            path: path.into(),
            content: content.into(),
            mode,
        }
    }
}

/// A named, idempotent unit of provisioning work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub name: String,
    pub actions: Vec<StepAction>,
}

impl SetupStep {
    pub fn new(name: impl Into<String>, actions: Vec<StepAction>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }
}

/// Result of checking an instance's tag record against an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Missing,
    Unreadable { reason: String },
    Mismatched { found: String },
}

impl Compatibility {
    fn from_stored(stored: &StoredTag, expected: &str) -> Self {
        match stored {
            StoredTag::Present(tag) if tag == expected => Self::Compatible,
            StoredTag::Present(tag) => Self::Mismatched { found: tag.clone() },
            StoredTag::Missing => Self::Missing,
            StoredTag::Unreadable { reason } => Self::Unreadable {
                reason: reason.clone(),
            },
        }
    }

    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible)
    }
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compatible => write!(f, "compatible"),
            Self::Missing => write!(f, "no compatibility tag"),
            Self::Unreadable { reason } => write!(f, "unreadable compatibility tag ({reason})"),
            Self::Mismatched { found } => write!(f, "foreign compatibility tag '{found}'"),
        }
    }
}

/// How a successful `setup` got there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Tag matched; only readiness was checked
    Validated,
    /// All steps ran and the tag was written
    Provisioned,
}

/// Summary of a successful `setup`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReport {
    pub image: String,
    pub compatibility_tag: String,
    /// Tag value found before this session, if any
    pub previous_tag: Option<String>,
    pub outcome: SetupOutcome,
    /// Names of the steps that ran, in order
    pub steps_run: Vec<String>,
    pub states: Vec<ProvisionState>,
}

/// A base image: its steps, its tag and the protocol that applies them
#[async_trait]
pub trait Image: Send + Sync {
    /// Human-readable identifier
    fn name(&self) -> &str;

    /// Opaque version of this image's provisioning scheme
    ///
    /// Must change whenever the semantics of any step change.
    fn compatibility_tag(&self) -> String;

    /// Ordered setup steps
    fn steps(&self) -> Vec<SetupStep>;

    /// Lightweight check run on instances that are already tagged
    fn readiness_probe(&self) -> Probe;

    /// Environment every command inside this image runs with
    fn get_command_environment(&self) -> BTreeMap<String, String>;

    /// Where the tag record lives inside the instance
    fn tag_location(&self) -> &str {
        DEFAULT_TAG_LOCATION
    }

    /// Upper bound for each command issued by a setup step
    fn command_timeout(&self) -> Option<Duration> {
        None
    }

    /// Image-specific sanity checks (e.g. the OS release)
    async fn ensure_compatible(&self, _executor: &dyn Executor) -> Result<(), ImageError> {
        Ok(())
    }

    /// Compare the instance's tag record with this image without changing
    /// anything
    async fn check_compatibility(&self, executor: &dyn Executor) -> Result<Compatibility, ImageError> {
        let stored = tag::read_tag(executor, self.tag_location()).await?;
        Ok(Compatibility::from_stored(&stored, &self.compatibility_tag()))
    }

    /// Run a single command with this image's environment
    ///
    /// Variables in `options.env` take precedence. Not retried.
    async fn execute_run(
        &self,
        executor: &dyn Executor,
        argv: &[String],
        options: RunOptions,
    ) -> Result<ExecResult, ExecutorError> {
        let mut env = self.get_command_environment();
        env.extend(options.env.clone());
        let options = options.with_env(env);
        executor.run(argv, &options).await
    }

    /// Bring the instance to this image's baseline, or confirm it is there
    async fn setup(&self, executor: &dyn Executor) -> Result<SetupReport, ImageError> {
        let mut session = Session::new();
        let tag = self.compatibility_tag();
        info!("Setting up image {} (compatibility tag {})", self.name(), tag);

        match drive_setup(self, executor, &tag, &mut session).await {
            Ok((outcome, previous_tag, steps_run)) => {
                info!("Image {} is ready ({:?})", self.name(), outcome);
                Ok(SetupReport {
                    image: self.name().to_string(),
                    compatibility_tag: tag,
                    previous_tag,
                    outcome,
                    steps_run,
                    states: session.history().to_vec(),
                })
            }
            Err(e) => {
                session.fail();
                error!("Setup of image {} failed: {}", self.name(), e);
                Err(e)
            }
        }
    }
}

type DriveResult = (SetupOutcome, Option<String>, Vec<String>);

async fn drive_setup<I: Image + ?Sized>(
    image: &I,
    executor: &dyn Executor,
    tag: &str,
    session: &mut Session,
) -> Result<DriveResult, ImageError> {
    let location = image.tag_location();
    let stored = tag::read_tag(executor, location).await?;
    session.advance(ProvisionState::TagRead);
    let previous_tag = stored.value().map(str::to_string);
    let options = RunOptions::new()
        .with_env(image.get_command_environment())
        .with_timeout(image.command_timeout());

    if stored.matches(tag) {
        session.advance(ProvisionState::Compatible);
        info!("Instance already provisioned, checking readiness");
        wait_for(executor, &image.readiness_probe(), READINESS_STEP, &options).await?;
        image.ensure_compatible(executor).await?;
        session.advance(ProvisionState::Validated);
        return Ok((SetupOutcome::Validated, previous_tag, Vec::new()));
    }

    session.advance(ProvisionState::Incompatible);
    info!(
        "Instance needs provisioning: {}",
        Compatibility::from_stored(&stored, tag)
    );
    image.ensure_compatible(executor).await?;
    if stored != StoredTag::Missing {
        tag::clear_tag(executor, location).await?;
    }

    session.advance(ProvisionState::Provisioning);
    let steps = image.steps();
    let total = steps.len();
    let mut steps_run = Vec::with_capacity(total);
    for (i, step) in steps.iter().enumerate() {
        info!("Running step {}/{}: {}", i + 1, total, step.name);
        run_step(executor, step, i + 1, &options).await?;
        steps_run.push(step.name.clone());
    }

    tag::write_tag(executor, location, tag).await?;
    session.advance(ProvisionState::Ready);
    Ok((SetupOutcome::Provisioned, previous_tag, steps_run))
}

async fn run_step(
    executor: &dyn Executor,
    step: &SetupStep,
    index: usize,
    options: &RunOptions,
) -> Result<(), ImageError> {
    let fail = |failure: StepFailure| ImageError::StepExecution {
        index,
        step: step.name.clone(),
        failure,
    };

    for action in &step.actions {
        match action {
            StepAction::Run {
                argv,
                allowed_exit_codes,
            } => {
                let result = executor
                    .run(argv, options)
                    .await
                    .map_err(|e| fail(e.into()))?;
                if !result.success() && !allowed_exit_codes.contains(&result.exit_code) {
                    return Err(fail(StepFailure::ExitStatus {
                        command: quote_command(argv),
                        exit_code: result.exit_code,
                        stdout: result.stdout_str(),
                        stderr: result.stderr_str(),
                    }));
                }
            }
            StepAction::WriteFile {
                path,
                content,
                mode,
            } => {
                debug!("Writing {} ({:04o})", path, mode);
                executor
                    .write_file(path, content, *mode)
                    .await
                    .map_err(|e| fail(e.into()))?;
            }
            StepAction::Wait(probe) => {
                wait_for(executor, probe, &step.name, options).await?;
            }
        }
    }
    Ok(())
}

/// Poll `probe` until it succeeds or its timeout elapses
///
/// Executor failures while polling count as "not ready yet".
async fn wait_for(
    executor: &dyn Executor,
    probe: &Probe,
    step: &str,
    options: &RunOptions,
) -> Result<(), ImageError> {
    info!("Waiting for {}...", probe.description);
    let deadline = Instant::now() + probe.timeout;
    let mut last_output = None;

    loop {
        // The last attempt may start right at the deadline, so it still gets
        // at least one interval to answer
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(probe.interval);
        let attempt_options = options.clone().with_timeout(Some(
            options.timeout.map_or(remaining, |t| t.min(remaining)),
        ));

        match executor.run(&probe.argv, &attempt_options).await {
            Ok(result) if probe.accepts(&result) => {
                debug!("{} ready", probe.description);
                return Ok(());
            }
            Ok(result) => {
                let output = result.stdout_str().trim().to_string();
                debug!(
                    "{}: not ready (exit {}, output {:?})",
                    quote_command(&probe.argv),
                    result.exit_code,
                    output
                );
                last_output = Some(output);
            }
            Err(e) => {
                debug!("{}: {}", quote_command(&probe.argv), e);
                last_output = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ImageError::ReadinessTimeout {
                step: step.to_string(),
                probe: probe.description.clone(),
                timeout: probe.timeout,
                last_output,
            });
        }
        tokio::time::sleep(probe.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FakeExecutor;
    use crate::executor::fake::{FakeFailure, Invocation};

    /// Minimal image with three single-command steps
    struct TestImage {
        tag: String,
    }

    impl TestImage {
        fn new(tag: &str) -> Self {
            Self {
                tag: tag.to_string(),
            }
        }
    }

    #[async_trait]
    impl Image for TestImage {
        fn name(&self) -> &str {
            "test"
        }

        fn compatibility_tag(&self) -> String {
            self.tag.clone()
        }

        fn steps(&self) -> Vec<SetupStep> {
            vec![
                SetupStep::new("one", vec![StepAction::run(&["step-one"])]),
                SetupStep::new("two", vec![StepAction::run_allowing(&["step-two"], &[9])]),
                SetupStep::new(
                    "three",
                    vec![StepAction::write_file("/etc/three", "3\n", 0o600)],
                ),
            ]
        }

        fn readiness_probe(&self) -> Probe {
            Probe::new("tool", &["tool", "--version"], ProbeAccept::ExitSuccess)
                .with_timeout(Duration::from_millis(50))
                .with_interval(Duration::from_millis(10))
        }

        fn get_command_environment(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())])
        }
    }

    #[tokio::test]
    async fn test_fresh_instance_runs_all_steps() {
        let fake = FakeExecutor::new();
        let image = TestImage::new("t1");

        let report = image.setup(&fake).await.unwrap();

        assert_eq!(report.outcome, SetupOutcome::Provisioned);
        assert_eq!(report.steps_run, vec!["one", "two", "three"]);
        assert_eq!(report.previous_tag, None);
        assert_eq!(
            report.states,
            vec![
                ProvisionState::Unchecked,
                ProvisionState::TagRead,
                ProvisionState::Incompatible,
                ProvisionState::Provisioning,
                ProvisionState::Ready,
            ]
        );
        assert_eq!(fake.file_string("/etc/three").as_deref(), Some("3\n"));
        assert!(
            image
                .check_compatibility(&fake)
                .await
                .unwrap()
                .is_compatible()
        );
    }

    #[tokio::test]
    async fn test_allowed_exit_code_is_not_a_failure() {
        let fake = FakeExecutor::new().with_response(&["step-two"], 9, "", "already exists");
        let report = TestImage::new("t1").setup(&fake).await.unwrap();
        assert_eq!(report.outcome, SetupOutcome::Provisioned);
    }

    #[tokio::test]
    async fn test_steps_run_with_image_environment() {
        let fake = FakeExecutor::new();
        TestImage::new("t1").setup(&fake).await.unwrap();

        let run = fake
            .invocations()
            .into_iter()
            .find_map(|inv| match inv {
                Invocation::Run { argv, options } if argv[0] == "step-one" => Some(options),
                _ => None,
            })
            .unwrap();
        assert_eq!(run.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[tokio::test]
    async fn test_executor_failure_in_step() {
        let fake = FakeExecutor::new()
            .with_failure(&["step-two"], FakeFailure::Connection("lost".into()));

        let err = TestImage::new("t1").setup(&fake).await.unwrap_err();
        match err {
            ImageError::StepExecution {
                index,
                step,
                failure: StepFailure::Executor(ExecutorError::Connection(_)),
            } => {
                assert_eq!(index, 2);
                assert_eq!(step, "two");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fake.file(DEFAULT_TAG_LOCATION), None);
    }

    #[tokio::test]
    async fn test_stale_tag_is_cleared_before_steps() {
        let fake = FakeExecutor::new()
            .with_file(DEFAULT_TAG_LOCATION, "compatibility_tag: old\n")
            .with_response(&["step-one"], 1, "", "boom");

        let err = TestImage::new("t2").setup(&fake).await.unwrap_err();
        assert!(matches!(err, ImageError::StepExecution { index: 1, .. }));
        assert!(err.left_instance_indeterminate());
        assert_eq!(fake.file(DEFAULT_TAG_LOCATION), None);
    }

    #[tokio::test]
    async fn test_tag_write_failure_is_distinct() {
        let fake = FakeExecutor::new().with_write_failure(FakeFailure::Connection("gone".into()));
        // Only the tag write goes through write_file once step three is gone
        struct NoFiles(TestImage);

        #[async_trait]
        impl Image for NoFiles {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn compatibility_tag(&self) -> String {
                self.0.compatibility_tag()
            }
            fn steps(&self) -> Vec<SetupStep> {
                self.0.steps().into_iter().take(2).collect()
            }
            fn readiness_probe(&self) -> Probe {
                self.0.readiness_probe()
            }
            fn get_command_environment(&self) -> BTreeMap<String, String> {
                self.0.get_command_environment()
            }
        }

        let err = NoFiles(TestImage::new("t1")).setup(&fake).await.unwrap_err();
        assert!(matches!(err, ImageError::TagWrite { .. }));
        assert!(fake.ran(&["step-two"]));
    }

    #[tokio::test]
    async fn test_readiness_probe_retries_until_ready() {
        let fake = FakeExecutor::new()
            .with_file(DEFAULT_TAG_LOCATION, "compatibility_tag: t1\n")
            .with_exit_sequence(&["tool"], &[1, 1, 0]);

        let report = TestImage::new("t1").setup(&fake).await.unwrap();
        assert_eq!(report.outcome, SetupOutcome::Validated);
        assert_eq!(fake.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_readiness_timeout_on_tagged_instance() {
        let fake = FakeExecutor::new()
            .with_file(DEFAULT_TAG_LOCATION, "compatibility_tag: t1\n")
            .with_response(&["tool"], 127, "", "not found");

        let err = TestImage::new("t1").setup(&fake).await.unwrap_err();
        match &err {
            ImageError::ReadinessTimeout { step, .. } => assert_eq!(step, READINESS_STEP),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.left_instance_indeterminate());
        assert!(!fake.ran(&["step-one"]));
        assert_eq!(
            fake.file_string(DEFAULT_TAG_LOCATION).as_deref(),
            Some("compatibility_tag: t1\n")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gets_its_whole_window() {
        let probe = Probe::new("tool", &["tool"], ProbeAccept::ExitSuccess)
            .with_timeout(Duration::from_secs(1))
            .with_interval(Duration::from_millis(300));
        // Attempts at 0, 300, 600 and 900 ms fail; the one at 1 s succeeds
        let fake = FakeExecutor::new().with_exit_sequence(&["tool"], &[1, 1, 1, 1, 0]);

        let started = Instant::now();
        wait_for(&fake, &probe, READINESS_STEP, &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(fake.commands().len(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gives_up_at_the_deadline() {
        let probe = Probe::new("tool", &["tool"], ProbeAccept::ExitSuccess)
            .with_timeout(Duration::from_secs(1))
            .with_interval(Duration::from_millis(300));
        let fake = FakeExecutor::new().with_response(&["tool"], 1, "", "");

        let started = Instant::now();
        let err = wait_for(&fake, &probe, READINESS_STEP, &RunOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::ReadinessTimeout { .. }));
        assert_eq!(fake.commands().len(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execute_run_merges_environment() {
        let fake = FakeExecutor::new();
        let image = TestImage::new("t1");
        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
        env.insert("EXTRA".to_string(), "1".to_string());

        image
            .execute_run(&fake, &to_argv(&["make"]), RunOptions::new().with_env(env))
            .await
            .unwrap();

        match &fake.invocations()[0] {
            Invocation::Run { options, .. } => {
                assert_eq!(options.env["LANG"], "en_US.UTF-8");
                assert_eq!(options.env["EXTRA"], "1");
            }
            other => panic!("unexpected invocation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_compatibility_variants() {
        let image = TestImage::new("t1");

        let fake = FakeExecutor::new();
        assert_eq!(image.check_compatibility(&fake).await.unwrap(), Compatibility::Missing);

        let fake = FakeExecutor::new().with_file(DEFAULT_TAG_LOCATION, "compatibility_tag: t0\n");
        assert_eq!(
            image.check_compatibility(&fake).await.unwrap(),
            Compatibility::Mismatched {
                found: "t0".to_string()
            }
        );
        // Read-only
        assert!(fake.written_paths().is_empty());
        assert!(fake.commands().is_empty());
    }
}
