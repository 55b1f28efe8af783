//! Error types for buildbase-rs

use crate::executor::ExecutorError;
use crate::image::READINESS_STEP;
use std::time::Duration;
use thiserror::Error;

/// Main error type for provisioning operations
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to read compatibility tag at {location}: {source}")]
    TagRead {
        location: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Step {index} ('{step}') failed: {failure}")]
    StepExecution {
        /// 1-based position of the step in the image's sequence
        index: usize,
        step: String,
        failure: StepFailure,
    },

    #[error("Timed out after {timeout:?} in step '{step}' waiting for {probe}")]
    ReadinessTimeout {
        step: String,
        probe: String,
        timeout: Duration,
        last_output: Option<String>,
    },

    #[error("Instance provisioned but writing compatibility tag '{tag}' to {location} failed: {source}")]
    TagWrite {
        location: String,
        tag: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Failed to remove stale compatibility tag at {location}: {source}")]
    TagClear {
        location: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Instance is incompatible with image: {reason}")]
    Compatibility { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a setup step failed
#[derive(Error, Debug)]
pub enum StepFailure {
    #[error("'{command}' exited with status {exit_code}: {stderr}")]
    ExitStatus {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl ImageError {
    /// Create a compatibility error
    pub fn compatibility(reason: impl Into<String>) -> Self {
        Self::Compatibility {
            reason: reason.into(),
        }
    }

    /// Name of the step that failed, when the error came from one
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::StepExecution { step, .. } | Self::ReadinessTimeout { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Whether the instance may have been modified by the failed call
    ///
    /// Such an instance carries no valid compatibility tag and will be fully
    /// provisioned again by the next `setup`. A readiness timeout on an
    /// already tagged instance leaves it untouched.
    pub fn left_instance_indeterminate(&self) -> bool {
        match self {
            Self::ReadinessTimeout { step, .. } => step != READINESS_STEP,
            Self::StepExecution { .. } | Self::TagWrite { .. } => true,
            _ => false,
        }
    }
}
