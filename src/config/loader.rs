//! Configuration loader
//!
//! Loads the provisioning configuration from an explicit path or the default
//! location.

use super::ProvisionConfig;
use crate::ImageError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/buildbase/config.yaml";

/// Load configuration from a single file
///
/// Returns `None` if the file does not exist.
pub async fn load_config_file(
    path: impl AsRef<Path>,
) -> Result<Option<ProvisionConfig>, ImageError> {
    let path = path.as_ref();

    if !path.exists() {
        debug!("No configuration at {}", path.display());
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    let config = ProvisionConfig::from_yaml(&content).map_err(|e| {
        ImageError::Config(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    info!("Loaded configuration from {}", path.display());
    Ok(Some(config))
}

/// Load configuration, falling back to defaults
///
/// An explicitly given path must exist; the default location is optional.
pub async fn load_config(path: Option<&Path>) -> Result<ProvisionConfig, ImageError> {
    match path {
        Some(path) => load_config_file(path).await?.ok_or_else(|| {
            ImageError::Config(format!("Configuration file {} not found", path.display()))
        }),
        None => Ok(load_config_file(default_config_path())
            .await?
            .unwrap_or_default()),
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
