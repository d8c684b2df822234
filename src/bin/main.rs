//! Entry point of the synchronizer.
//!
//! Parses the command line, performs one-shot operations directly, and
//! otherwise wires the signal handler to the orchestrator and runs until
//! shutdown.

use crossbeam::channel::Sender;
use crowdsec_cloudflare_bouncer::bouncer::Bouncer;
use crowdsec_cloudflare_bouncer::cli::{Cli, CliCommand};
use crowdsec_cloudflare_bouncer::config::BouncerConfig;
use crowdsec_cloudflare_bouncer::event::{ApplicationEvent, application_channel};
use crowdsec_cloudflare_bouncer::metrics::Metrics;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> ExitCode {
    let cli_command = match Cli::init() {
        Ok(cli_command) => cli_command,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let config = match cli_command {
        CliCommand::Run(config) => config,
        CliCommand::OneShot(operation) => return operation.run_one_shot(),
    };

    match run(*config) {
        Ok(()) => {
            info!("exiting gracefully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error_msg = %err, "the synchronizer exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Separated from [main] so errors propagate with `?` and get logged once,
/// in string form, instead of the debug representation.
fn run(config: BouncerConfig) -> Result<(), Box<dyn Error>> {
    let (stop_sender, stop_receiver) = application_channel();
    create_shutdown_signal_handler(stop_sender)?;

    let metrics = Arc::new(Metrics::default());
    Bouncer::try_from_config(&config, metrics)?.run(stop_receiver)?;
    Ok(())
}

/// Routes Ctrl-C / SIGTERM into the orchestrator's event loop so it can stop
/// its children and tear the edge resources down before exiting. Repeated
/// signals are dropped: one stop request is all the loop needs.
fn create_shutdown_signal_handler(
    sender: Sender<ApplicationEvent>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("received shutdown signal, stopping the synchronizer");
        let _ = sender.try_send(ApplicationEvent::StopRequested);
    })
}
