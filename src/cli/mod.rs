//! Command line interface.
//!
//! Parses the arguments and decides how the process runs: the long-lived
//! synchronizer, or one of the one-shot operations (config generation and
//! inspection, provision-only, delete-only).

pub mod one_shot;

use crate::config::logging::{LoggingError, try_init_tracing};
use crate::config::{BouncerConfig, ConfigError};
use crate::defaults::{DEFAULT_CONFIG_PATH, PRODUCT_NAME, PRODUCT_VERSION};
use clap::Parser;
use one_shot::OneShotCommand;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),
}

/// What was requested from the command line.
pub enum CliCommand {
    /// Normal operation: run the synchronizer with this configuration.
    Run(Box<BouncerConfig>),
    /// Perform a single operation and exit.
    OneShot(OneShotCommand),
}

#[derive(Parser, Debug)]
#[command(name = PRODUCT_NAME, version = PRODUCT_VERSION, about = "CrowdSec remediation synchronizer for Cloudflare Workers KV")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Comma-separated Cloudflare API tokens: discover accounts and zones and
    /// emit a starter configuration.
    #[arg(short = 'g', long = "generate-config", value_delimiter = ',', value_name = "TOKENS")]
    generate: Option<Vec<String>>,

    /// Write the generated configuration to this path instead of stdout.
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(short = 't', long = "test-config")]
    test_config: bool,

    /// Print the effective configuration and exit.
    #[arg(short = 'T', long = "print-config")]
    print_config: bool,

    /// Tear down all provisioned Cloudflare resources and exit.
    #[arg(short = 'd', long = "delete-only")]
    delete_only: bool,

    /// Provision the Cloudflare resources and exit.
    #[arg(short = 's', long = "setup-only")]
    setup_only: bool,
}

impl Cli {
    /// Parses the command line and decides how the application runs.
    pub fn init() -> Result<CliCommand, CliError> {
        let cli = Self::parse();

        // Config generation works from bare tokens; no config file involved.
        if let Some(tokens) = cli.generate {
            return Ok(CliCommand::OneShot(OneShotCommand::GenerateConfig {
                tokens,
                output: cli.output,
            }));
        }

        let config = BouncerConfig::load(&cli.config)?;

        if cli.test_config {
            return Ok(CliCommand::OneShot(OneShotCommand::ConfigValid));
        }
        if cli.print_config {
            return Ok(CliCommand::OneShot(OneShotCommand::PrintConfig(Box::new(
                config,
            ))));
        }

        try_init_tracing(&config)?;
        info!("{PRODUCT_NAME} v{PRODUCT_VERSION}");

        if cli.delete_only {
            return Ok(CliCommand::OneShot(OneShotCommand::Teardown(Box::new(
                config,
            ))));
        }
        if cli.setup_only {
            return Ok(CliCommand::OneShot(OneShotCommand::Setup(Box::new(config))));
        }

        info!(
            config = %cli.config.to_string_lossy(),
            "starting with configuration file"
        );
        Ok(CliCommand::Run(Box::new(config)))
    }
}
