//! buildbase-rs library
//!
//! Provisions and validates ephemeral base images used as build
//! environments inside externally managed instances (containers or virtual
//! machines).
//!
//! # Overview
//!
//! - [`executor`]: how commands reach an instance ([`executor::Executor`])
//! - [`image`]: the provisioning protocol ([`image::Image`]) and the buildd
//!   specialization ([`image::BuilddImage`])
//! - [`config`]: file configuration for the command line tool
//!
//! Instances are never created or destroyed here: callers hand in an
//! executor bound to a live instance and get back a ready build environment
//! or a structured error.
//!
//! ```no_run
//! use buildbase_rs::executor::LxdExecutor;
//! use buildbase_rs::image::{BuilddAlias, BuilddConfig, BuilddImage, Image};
//!
//! # async fn run() -> Result<(), buildbase_rs::ImageError> {
//! let image = BuilddImage::new(BuilddAlias::Jammy, BuilddConfig::default())?;
//! let executor = LxdExecutor::new("buildd-jammy");
//! let report = image.setup(&executor).await?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod executor;
pub mod image;

mod error;

pub use error::{ImageError, StepFailure};
pub use image::{Compatibility, Image, SetupOutcome, SetupReport};
