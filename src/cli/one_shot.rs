//! One-shot operations requested from the CLI.

use crate::bouncer::Bouncer;
use crate::config::BouncerConfig;
use crate::config::generator::{LiveClientFactory, generate, render_yaml};
use crate::metrics::Metrics;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

pub enum OneShotCommand {
    /// `-g`: discover accounts/zones from tokens and emit a starter config.
    GenerateConfig {
        tokens: Vec<String>,
        output: Option<PathBuf>,
    },
    /// `-t`: the config already loaded and validated; report and exit.
    ConfigValid,
    /// `-T`: print the effective merged configuration.
    PrintConfig(Box<BouncerConfig>),
    /// `-s`: provision the edge resources and exit.
    Setup(Box<BouncerConfig>),
    /// `-d`: delete the edge resources and exit.
    Teardown(Box<BouncerConfig>),
}

impl OneShotCommand {
    pub fn run_one_shot(self) -> ExitCode {
        match self {
            OneShotCommand::GenerateConfig { tokens, output } => {
                generate_config(&tokens, output)
            }
            OneShotCommand::ConfigValid => {
                println!("the configuration is valid");
                ExitCode::SUCCESS
            }
            OneShotCommand::PrintConfig(config) => match render_yaml(&config) {
                Ok(rendered) => {
                    println!("{rendered}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("could not render the configuration: {err}");
                    ExitCode::FAILURE
                }
            },
            OneShotCommand::Setup(config) => {
                let result = Bouncer::try_from_config(&config, Arc::new(Metrics::default()))
                    .and_then(|mut bouncer| bouncer.provision_only());
                match result {
                    Ok(()) => {
                        println!("infrastructure provisioned");
                        ExitCode::SUCCESS
                    }
                    Err(err) => {
                        eprintln!("provisioning failed: {err}");
                        ExitCode::FAILURE
                    }
                }
            }
            OneShotCommand::Teardown(config) => {
                let result = Bouncer::try_from_config(&config, Arc::new(Metrics::default()))
                    .and_then(|bouncer| bouncer.teardown_all());
                match result {
                    Ok(()) => {
                        println!("infrastructure deleted");
                        ExitCode::SUCCESS
                    }
                    Err(err) => {
                        eprintln!("teardown failed: {err}");
                        ExitCode::FAILURE
                    }
                }
            }
        }
    }
}

fn generate_config(tokens: &[String], output: Option<PathBuf>) -> ExitCode {
    let rendered = match generate(tokens, &LiveClientFactory::new()).and_then(|c| render_yaml(&c))
    {
        Ok(rendered) => rendered,
        Err(err) => {
            eprintln!("config generation failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    match output {
        Some(path) => {
            if let Err(err) = std::fs::write(&path, rendered) {
                eprintln!("could not write `{}`: {err}", path.to_string_lossy());
                return ExitCode::FAILURE;
            }
            println!("configuration written to {}", path.to_string_lossy());
            ExitCode::SUCCESS
        }
        None => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
    }
}
