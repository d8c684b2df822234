//! Logging initialization.
//!
//! Logs are scoped to this crate: external crates are silenced by default so
//! header dumps and similar verbose output from HTTP internals never reach
//! the operator's log files.

use super::{BouncerConfig, LogMedia};
use crate::defaults::PRODUCT_NAME;
use std::sync::Mutex;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("could not initialize logging: {0}")]
    Init(String),

    #[error("could not open log file `{path}`: {err}")]
    LogFile { path: String, err: String },
}

/// Installs the global tracing subscriber according to the configuration.
pub fn try_init_tracing(config: &BouncerConfig) -> Result<(), LoggingError> {
    let directive = format!(
        "{}={}",
        PRODUCT_NAME.replace('-', "_"),
        config.log_level.as_str()
    );
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::OFF.into())
        .parse_lossy(directive);

    match config.log_media {
        LogMedia::Stdout => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|err| LoggingError::Init(err.to_string())),
        LogMedia::File => {
            let path = config.log_dir.join(format!("{PRODUCT_NAME}.log"));
            std::fs::create_dir_all(&config.log_dir).map_err(|err| LoggingError::LogFile {
                path: config.log_dir.to_string_lossy().into(),
                err: err.to_string(),
            })?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| LoggingError::LogFile {
                    path: path.to_string_lossy().into(),
                    err: err.to_string(),
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|err| LoggingError::Init(err.to_string()))
        }
    }
}
