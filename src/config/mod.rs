//! Provisioning configuration
//!
//! Parsed from a YAML file such as:
//!
//! ```yaml
//! alias: jammy
//! buildd:
//!   package_set: [build-essential, git]
//!   user_name: builder
//!   timeout_secs: 120
//! target:
//!   lxd:
//!     instance: buildd-jammy
//!     project: default
//! retry:
//!   max_retries: 3
//! ```

pub mod loader;

use crate::ImageError;
use crate::executor::{Executor, HostExecutor, LxdExecutor, RetryConfig, RetryingExecutor};
use crate::image::{BuilddAlias, BuilddConfig, BuilddImage};
use serde::{Deserialize, Serialize};

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Release of the buildd image
    pub alias: BuilddAlias,
    /// Image tunables
    pub buildd: BuilddConfig,
    /// Instance to provision
    pub target: TargetConfig,
    /// Retry policy for transient executor failures
    pub retry: RetryConfig,
}

/// Where commands are executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetConfig {
    /// The local machine
    Host {
        #[serde(default)]
        sudo_user: Option<String>,
    },
    /// An existing LXD instance
    Lxd {
        instance: String,
        #[serde(default = "default_project")]
        project: String,
        #[serde(default = "default_remote")]
        remote: String,
    },
}

fn default_project() -> String {
    "default".to_string()
}

fn default_remote() -> String {
    "local".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::Host { sudo_user: None }
    }
}

impl ProvisionConfig {
    /// Parse configuration from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Build the image described by this configuration
    pub fn build_image(&self) -> Result<BuilddImage, ImageError> {
        BuilddImage::new(self.alias, self.buildd.clone())
    }

    /// Build an executor for the configured target
    pub fn build_executor(&self) -> Box<dyn Executor> {
        match &self.target {
            TargetConfig::Host { sudo_user } => {
                let host = match sudo_user {
                    Some(user) => HostExecutor::with_sudo_user(user),
                    None => HostExecutor::new(),
                };
                Box::new(RetryingExecutor::new(host, self.retry))
            }
            TargetConfig::Lxd {
                instance,
                project,
                remote,
            } => {
                let lxd = LxdExecutor::new(instance)
                    .with_project(project)
                    .with_remote(remote);
                Box::new(RetryingExecutor::new(lxd, self.retry))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
alias: jammy
buildd:
  package_set: [build-essential, git]
  user_name: ci
  timeout_secs: 120
target:
  lxd:
    instance: buildd-jammy
retry:
  max_retries: 4
"#;
        let config = ProvisionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.alias, BuilddAlias::Jammy);
        assert_eq!(config.buildd.package_set, vec!["build-essential", "git"]);
        assert_eq!(config.buildd.timeout, Duration::from_secs(120));
        assert_eq!(
            config.target,
            TargetConfig::Lxd {
                instance: "buildd-jammy".to_string(),
                project: "default".to_string(),
                remote: "local".to_string(),
            }
        );
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.backoff_base_ms, 500);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = ProvisionConfig::from_yaml("").unwrap();
        assert_eq!(config, ProvisionConfig::default());
        assert_eq!(config.target, TargetConfig::Host { sudo_user: None });
    }

    #[test]
    fn test_host_target_with_sudo() {
        let config = ProvisionConfig::from_yaml("target:\n  host:\n    sudo_user: root\n").unwrap();
        assert_eq!(
            config.target,
            TargetConfig::Host {
                sudo_user: Some("root".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_alias_is_rejected() {
        assert!(ProvisionConfig::from_yaml("alias: warty\n").is_err());
    }

    #[test]
    fn test_build_image_validates() {
        let config = ProvisionConfig::from_yaml("buildd:\n  user_name: 'Bad User'\n").unwrap();
        assert!(matches!(config.build_image(), Err(ImageError::Config(_))));
    }
}
