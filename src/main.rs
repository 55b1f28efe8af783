//! buildbase-rs - provision and validate base images for build environments

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use buildbase_rs::config::{ProvisionConfig, TargetConfig, loader};
use buildbase_rs::image::BuilddAlias;
use buildbase_rs::{Image, SetupOutcome};

#[derive(Parser)]
#[command(name = "buildbase-rs")]
#[command(author, version, about = "Provision and validate build environment base images", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (default: /etc/buildbase/config.yaml if present)
    #[arg(short, long, env = "BUILDBASE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the buildd release (codename or version)
    #[arg(long)]
    alias: Option<String>,

    /// Provision this LXD instance instead of the configured target
    #[arg(long)]
    lxd_instance: Option<String>,

    /// LXD project used with --lxd-instance
    #[arg(long, default_value = "default", requires = "lxd_instance")]
    lxd_project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the target, or validate it if already provisioned
    Setup,
    /// Check the target's compatibility tag without changing anything
    Check,
    /// Print the compatibility tag for the configuration
    Tag,
    /// Print the command environment of the image
    Env,
}

fn verbosity_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// `RUST_LOG` wins over `-v` when set
fn log_filter(verbosity: u8, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(verbosity_level(verbosity).as_str()))
}

fn init_logging(verbosity: u8) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(verbosity, rust_log.as_deref()))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

async fn load_config(cli: &Cli) -> anyhow::Result<ProvisionConfig> {
    let mut config = loader::load_config(cli.config.as_deref())
        .await
        .context("loading configuration")?;

    if let Some(alias) = &cli.alias {
        config.alias = alias.parse::<BuilddAlias>()?;
    }
    if let Some(instance) = &cli.lxd_instance {
        config.target = TargetConfig::Lxd {
            instance: instance.clone(),
            project: cli.lxd_project.clone(),
            remote: "local".to_string(),
        };
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli).await?;
    let image = config.build_image().context("invalid image configuration")?;

    match cli.command {
        Commands::Setup => {
            let executor = config.build_executor();
            let report = image
                .setup(executor.as_ref())
                .await
                .with_context(|| format!("setting up buildd {}", image.alias()))?;
            match report.outcome {
                SetupOutcome::Validated => info!("Instance already provisioned and ready"),
                SetupOutcome::Provisioned => {
                    info!("Provisioned: {}", report.steps_run.join(", "))
                }
            }
            println!("{}", report.compatibility_tag);
        }
        Commands::Check => {
            let executor = config.build_executor();
            let compatibility = image
                .check_compatibility(executor.as_ref())
                .await
                .context("reading compatibility tag")?;
            println!("{compatibility}");
            if !compatibility.is_compatible() {
                bail!("instance is not compatible with {}", image.compatibility_tag());
            }
        }
        Commands::Tag => {
            println!("{}", image.compatibility_tag());
        }
        Commands::Env => {
            for (key, value) in image.get_command_environment() {
                println!("{key}={value}");
            }
        }
    }

    Ok(())
}
