//! Buildd-style Ubuntu image
//!
//! Brings a fresh Ubuntu buildd instance to a minimal build baseline:
//!
//! 1. `system-ready` - wait for systemd, set the hostname, configure
//!    systemd-resolved and systemd-networkd, wait for DNS
//! 2. `package-index` - `apt-get update`
//! 3. `packages` - install the configured package set
//! 4. `build-user` - build user, group and work directories
//! 5. `environment` - profile snippet exporting the command environment
//! 6. `snapd` - only when enabled
//!
//! The order is part of the compatibility contract: [`REVISION`] must be
//! bumped whenever any step changes.

use super::os_release::{OS_RELEASE_PATH, parse_os_release};
use super::{Image, Probe, ProbeAccept, SetupStep, StepAction};
use crate::ImageError;
use crate::executor::Executor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Revision of the buildd step sequence
pub const REVISION: u32 = 1;

/// Profile snippet written by the `environment` step
pub const ENVIRONMENT_FILE: &str = "/etc/profile.d/buildbase-environment.sh";

/// Host resolved to decide that networking works
pub const NETWORK_PROBE_HOST: &str = "archive.ubuntu.com";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/snap/bin";

const NETWORKD_CONFIG: &str = "\
[Match]
Name=eth0

[Network]
DHCP=ipv4
LinkLocalAddressing=ipv6

[DHCP]
RouteMetric=100
UseMTU=true
";

/// Supported buildd releases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilddAlias {
    Xenial,
    Bionic,
    #[default]
    Focal,
    Jammy,
    Noble,
}

impl BuilddAlias {
    pub const ALL: [BuilddAlias; 5] = [
        Self::Xenial,
        Self::Bionic,
        Self::Focal,
        Self::Jammy,
        Self::Noble,
    ];

    /// Ubuntu release version, as found in `VERSION_ID`
    pub fn version(&self) -> &'static str {
        match self {
            Self::Xenial => "16.04",
            Self::Bionic => "18.04",
            Self::Focal => "20.04",
            Self::Jammy => "22.04",
            Self::Noble => "24.04",
        }
    }

    pub fn codename(&self) -> &'static str {
        match self {
            Self::Xenial => "xenial",
            Self::Bionic => "bionic",
            Self::Focal => "focal",
            Self::Jammy => "jammy",
            Self::Noble => "noble",
        }
    }
}

impl fmt::Display for BuilddAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codename())
    }
}

impl FromStr for BuilddAlias {
    type Err = ImageError;

    /// Accepts a codename (`focal`) or a version (`20.04`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|alias| alias.codename() == s || alias.version() == s)
            .ok_or_else(|| ImageError::Config(format!("Unknown buildd alias: {s}")))
    }
}

/// Durations are configured in whole seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&d.as_secs()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_secs))
        }
    }
}

/// Tunables of the buildd image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilddConfig {
    /// Packages installed by the `packages` step
    pub package_set: Vec<String>,
    /// Unprivileged build user (and its primary group)
    pub user_name: String,
    pub hostname: String,
    /// Directories owned by the build user
    pub work_dirs: Vec<String>,
    /// Bound for each readiness wait
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
    /// Bound for each individual setup command
    #[serde(rename = "command_timeout_secs", with = "secs::option")]
    pub command_timeout: Option<Duration>,
    pub install_snapd: bool,
    /// Added to (and overriding) the default command environment
    pub extra_env: BTreeMap<String, String>,
    /// Verify `/etc/os-release` matches the alias
    pub check_os: bool,
}

impl Default for BuilddConfig {
    fn default() -> Self {
        Self {
            package_set: ["build-essential", "ca-certificates", "git", "sudo", "locales"]
                .map(String::from)
                .to_vec(),
            user_name: "builder".to_string(),
            hostname: "buildbase-instance".to_string(),
            work_dirs: vec!["/build".to_string()],
            timeout: Duration::from_secs(60),
            command_timeout: None,
            install_snapd: false,
            extra_env: BTreeMap::new(),
            check_os: true,
        }
    }
}

/// The parts of the configuration that change what ends up in the instance
#[derive(Serialize)]
struct TagInputs<'a> {
    package_set: &'a [String],
    user_name: &'a str,
    hostname: &'a str,
    work_dirs: &'a [String],
    install_snapd: bool,
    extra_env: &'a BTreeMap<String, String>,
}

impl BuilddConfig {
    /// Reject values that would turn into broken or unsafe commands
    pub fn validate(&self) -> Result<(), ImageError> {
        if !is_valid_name(&self.user_name) {
            return Err(ImageError::Config(format!(
                "Invalid user name: {:?}",
                self.user_name
            )));
        }
        if self.hostname.is_empty()
            || !self
                .hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(ImageError::Config(format!(
                "Invalid hostname: {:?}",
                self.hostname
            )));
        }
        if let Some(pkg) = self
            .package_set
            .iter()
            .find(|p| p.is_empty() || p.starts_with('-') || p.contains(char::is_whitespace))
        {
            return Err(ImageError::Config(format!("Invalid package name: {pkg:?}")));
        }
        if let Some(dir) = self.work_dirs.iter().find(|d| !d.starts_with('/')) {
            return Err(ImageError::Config(format!(
                "Work directory must be absolute: {dir:?}"
            )));
        }
        if let Some(key) = self.extra_env.keys().find(|k| !is_env_key(k)) {
            return Err(ImageError::Config(format!(
                "Invalid environment variable name: {key:?}"
            )));
        }
        if self.timeout.is_zero() {
            return Err(ImageError::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Short digest of everything that shapes the provisioned instance
    pub fn digest(&self) -> Result<String, ImageError> {
        let inputs = TagInputs {
            package_set: &self.package_set,
            user_name: &self.user_name,
            hostname: &self.hostname,
            work_dirs: &self.work_dirs,
            install_snapd: self.install_snapd,
            extra_env: &self.extra_env,
        };
        let canonical = serde_json::to_vec(&inputs)?;
        let hash = hex::encode(Sha256::digest(&canonical));
        Ok(hash[..12].to_string())
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && name.len() <= 32
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Buildd image configurator
#[derive(Debug, Clone)]
pub struct BuilddImage {
    alias: BuilddAlias,
    name: String,
    config: BuilddConfig,
    compatibility_tag: String,
}

impl BuilddImage {
    /// Validate `config` and fix the compatibility tag for it
    pub fn new(alias: BuilddAlias, config: BuilddConfig) -> Result<Self, ImageError> {
        config.validate()?;
        let compatibility_tag = format!(
            "buildd-{}-r{}-{}",
            alias.version(),
            REVISION,
            config.digest()?
        );
        debug!("Buildd {} compatibility tag: {}", alias, compatibility_tag);
        Ok(Self {
            alias,
            name: alias.version().to_string(),
            config,
            compatibility_tag,
        })
    }

    pub fn alias(&self) -> BuilddAlias {
        self.alias
    }

    pub fn config(&self) -> &BuilddConfig {
        &self.config
    }

    fn wait_for_system_ready(&self) -> Probe {
        Probe::new(
            "systemd to reach a running state",
            &["systemctl", "is-system-running"],
            ProbeAccept::StdoutOneOf(vec!["running".to_string(), "degraded".to_string()]),
        )
        .with_timeout(self.config.timeout)
    }

    fn wait_for_network(&self) -> Probe {
        Probe::new(
            "networking to be ready",
            &["getent", "hosts", NETWORK_PROBE_HOST],
            ProbeAccept::ExitSuccess,
        )
        .with_timeout(self.config.timeout)
    }

    fn step_system_ready(&self) -> SetupStep {
        SetupStep::new(
            "system-ready",
            vec![
                StepAction::Wait(self.wait_for_system_ready()),
                StepAction::write_file("/etc/hostname", format!("{}\n", self.config.hostname), 0o644),
                StepAction::run(&["ln", "-sf", "/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"]),
                StepAction::run(&["systemctl", "enable", "systemd-resolved"]),
                StepAction::run(&["systemctl", "restart", "systemd-resolved"]),
                StepAction::write_file("/etc/systemd/network/10-eth0.network", NETWORKD_CONFIG, 0o644),
                StepAction::run(&["systemctl", "enable", "systemd-networkd"]),
                StepAction::run(&["systemctl", "restart", "systemd-networkd"]),
                StepAction::Wait(self.wait_for_network()),
            ],
        )
    }

    fn step_package_index(&self) -> SetupStep {
        SetupStep::new("package-index", vec![StepAction::run(&["apt-get", "update"])])
    }

    fn step_packages(&self) -> SetupStep {
        let actions = if self.config.package_set.is_empty() {
            Vec::new()
        } else {
            let mut argv: Vec<String> = ["apt-get", "install", "--yes", "--no-install-recommends"]
                .map(String::from)
                .to_vec();
            argv.extend(self.config.package_set.iter().cloned());
            vec![StepAction::run_args(argv)]
        };
        SetupStep::new("packages", actions)
    }

    fn step_build_user(&self) -> SetupStep {
        let user = self.config.user_name.as_str();
        let mut actions = vec![
            StepAction::run(&["groupadd", "--force", user]),
            // Exit code 9 means the user already exists
            StepAction::run_allowing(
                &["useradd", "--create-home", "--shell", "/bin/bash", "--gid", user, user],
                &[9],
            ),
        ];
        for dir in &self.config.work_dirs {
            actions.push(StepAction::run(&[
                "install",
                "-d",
                "-m",
                "0755",
                "-o",
                user,
                "-g",
                user,
                dir.as_str(),
            ]));
        }
        SetupStep::new("build-user", actions)
    }

    fn step_environment(&self) -> SetupStep {
        SetupStep::new(
            "environment",
            vec![StepAction::write_file(
                ENVIRONMENT_FILE,
                render_environment(&self.get_command_environment()),
                0o644,
            )],
        )
    }

    fn step_snapd(&self) -> SetupStep {
        SetupStep::new(
            "snapd",
            vec![
                StepAction::run(&["apt-get", "install", "--yes", "fuse", "udev"]),
                StepAction::run(&["systemctl", "enable", "systemd-udevd"]),
                StepAction::run(&["systemctl", "start", "systemd-udevd"]),
                StepAction::run(&["apt-get", "install", "--yes", "snapd"]),
                StepAction::run(&["systemctl", "start", "snapd.socket"]),
                StepAction::run(&["systemctl", "start", "snapd.service"]),
                StepAction::run(&["snap", "wait", "system", "seed.loaded"]),
            ],
        )
    }
}

/// Render the profile snippet exporting `env`
pub fn render_environment(env: &BTreeMap<String, String>) -> String {
    let mut content = String::from("# Managed by buildbase-rs, changes are overwritten.\n");
    for (key, value) in env {
        content.push_str(&format!("export {}='{}'\n", key, value.replace('\'', r"'\''")));
    }
    content
}

#[async_trait]
impl Image for BuilddImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn compatibility_tag(&self) -> String {
        self.compatibility_tag.clone()
    }

    fn steps(&self) -> Vec<SetupStep> {
        let mut steps = vec![
            self.step_system_ready(),
            self.step_package_index(),
            self.step_packages(),
            self.step_build_user(),
            self.step_environment(),
        ];
        if self.config.install_snapd {
            steps.push(self.step_snapd());
        }
        steps
    }

    fn readiness_probe(&self) -> Probe {
        self.wait_for_system_ready()
    }

    fn get_command_environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
            ("DEBCONF_NONINTERACTIVE_SEEN".to_string(), "true".to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("PATH".to_string(), DEFAULT_PATH.to_string()),
        ]);
        env.extend(self.config.extra_env.clone());
        env
    }

    fn command_timeout(&self) -> Option<Duration> {
        self.config.command_timeout
    }

    async fn ensure_compatible(&self, executor: &dyn Executor) -> Result<(), ImageError> {
        if !self.config.check_os {
            return Ok(());
        }

        let content = executor
            .read_file(OS_RELEASE_PATH)
            .await?
            .ok_or_else(|| ImageError::compatibility(format!("{OS_RELEASE_PATH} not found")))?;
        let release = parse_os_release(&String::from_utf8_lossy(&content));

        let is_ubuntu = release.get("ID").map(String::as_str) == Some("ubuntu")
            || release.get("NAME").map(String::as_str) == Some("Ubuntu");
        if !is_ubuntu {
            return Err(ImageError::compatibility(format!(
                "Expected OS 'Ubuntu', found {:?}",
                release.get("NAME").or_else(|| release.get("ID"))
            )));
        }

        let version_id = release.get("VERSION_ID").map(String::as_str);
        if version_id != Some(self.alias.version()) {
            return Err(ImageError::compatibility(format!(
                "Expected OS version {:?}, found {:?}",
                self.alias.version(),
                version_id
            )));
        }

        info!("Instance runs Ubuntu {}", self.alias.version());
        Ok(())
    }
}
