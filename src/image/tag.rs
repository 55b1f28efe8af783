//! Compatibility tag record stored inside the instance
//!
//! The record is a small YAML document at a fixed path:
//!
//! ```yaml
//! compatibility_tag: buildd-20.04-r1-3f2a9c0d1e4b
//! ```
//!
//! Its presence with an exactly matching value is the only evidence that an
//! instance was provisioned by a given step sequence. It is written through
//! [`Executor::write_file`], which replaces the file atomically.

use crate::ImageError;
use crate::executor::{Executor, ExecutorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default location of the tag record
pub const DEFAULT_TAG_LOCATION: &str = "/etc/buildbase-image.conf";

/// File mode of the tag record
const TAG_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TagRecord {
    compatibility_tag: String,
}

/// What was found at the tag location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredTag {
    /// No record at all
    Missing,
    /// Something is there but it is not a valid record
    Unreadable { reason: String },
    Present(String),
}

impl StoredTag {
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Present(tag) => Some(tag),
            _ => None,
        }
    }

    /// Exact comparison against `expected`
    pub fn matches(&self, expected: &str) -> bool {
        self.value() == Some(expected)
    }
}

/// Serialize a tag into the record format
pub fn encode(tag: &str) -> Result<String, ImageError> {
    Ok(serde_yaml::to_string(&TagRecord {
        compatibility_tag: tag.to_string(),
    })?)
}

/// Parse a record, returning `None` if it is not a valid one
pub fn decode(content: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(content).ok()?;
    serde_yaml::from_str::<TagRecord>(text)
        .ok()
        .map(|record| record.compatibility_tag)
}

/// Read the record at `location`
///
/// Missing or malformed records are reported as such; only a failure to
/// reach the instance is an error.
pub async fn read_tag(executor: &dyn Executor, location: &str) -> Result<StoredTag, ImageError> {
    match executor.read_file(location).await {
        Ok(None) => {
            debug!("No compatibility tag at {}", location);
            Ok(StoredTag::Missing)
        }
        Ok(Some(content)) => match decode(&content) {
            Some(tag) => {
                debug!("Found compatibility tag '{}' at {}", tag, location);
                Ok(StoredTag::Present(tag))
            }
            None => {
                warn!("Ignoring malformed compatibility tag record at {}", location);
                Ok(StoredTag::Unreadable {
                    reason: "malformed record".to_string(),
                })
            }
        },
        Err(ExecutorError::CommandFailed { stderr, .. }) => {
            warn!("Compatibility tag at {} is unreadable: {}", location, stderr);
            Ok(StoredTag::Unreadable { reason: stderr })
        }
        Err(source) => Err(ImageError::TagRead {
            location: location.to_string(),
            source,
        }),
    }
}

/// Write `tag` to `location`
pub async fn write_tag(executor: &dyn Executor, location: &str, tag: &str) -> Result<(), ImageError> {
    let content = encode(tag)?;
    executor
        .write_file(location, content.as_bytes(), TAG_FILE_MODE)
        .await
        .map_err(|source| ImageError::TagWrite {
            location: location.to_string(),
            tag: tag.to_string(),
            source,
        })?;
    debug!("Wrote compatibility tag '{}' to {}", tag, location);
    Ok(())
}

/// Remove a stale record so a partially provisioned instance carries none
pub async fn clear_tag(executor: &dyn Executor, location: &str) -> Result<(), ImageError> {
    executor
        .remove_file(location)
        .await
        .map_err(|source| ImageError::TagClear {
            location: location.to_string(),
            source,
        })?;
    debug!("Cleared stale compatibility tag at {}", location);
    Ok(())
}
