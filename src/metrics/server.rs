//! Prometheus exposition endpoint.
//!
//! The actix server runs on its own OS thread over a current-thread tokio
//! runtime so the rest of the process stays synchronous. Startup is
//! handshaked through a channel so bind errors surface to the caller instead
//! of dying silently in the background.

use super::Metrics;
use crate::config::PrometheusConfig;
use crate::utils::background::{BackgroundJob, StopSignal};
use actix_web::{App, HttpResponse, HttpServer, web};
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Debug, Error)]
pub enum ExpositionError {
    #[error("could not bind the exposition endpoint: {0}")]
    Bind(String),

    #[error("exposition endpoint did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("exposition endpoint thread died during startup")]
    StartupChannelClosed,
}

pub struct ExpositionServer {
    listen_addr: String,
    listen_port: u16,
    metrics: Arc<Metrics>,
}

impl ExpositionServer {
    pub fn new(config: &PrometheusConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            metrics,
        }
    }

    /// Starts the server thread and waits for the bind result.
    pub fn start(self) -> Result<BackgroundJob, ExpositionError> {
        let (startup_publisher, startup_consumer) = std::sync::mpsc::channel();

        let job = BackgroundJob::spawn("prometheus-exposition", move |stop| {
            self.serve(stop, startup_publisher)
        });

        let startup_result = startup_consumer
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => ExpositionError::StartupTimeout(STARTUP_TIMEOUT),
                RecvTimeoutError::Disconnected => ExpositionError::StartupChannelClosed,
            })?;
        if let Err(err) = startup_result {
            let _ = job.shutdown();
            return Err(ExpositionError::Bind(err));
        }
        Ok(job)
    }

    fn serve(self, stop: StopSignal, startup_publisher: Sender<Result<(), String>>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = startup_publisher.send(Err(err.to_string()));
                return;
            }
        };

        // Bridge the synchronous stop channel into the async select. The
        // recv unblocks when the channel fires or closes, either of which
        // means shutdown.
        let (cancel_publisher, cancel_consumer) = tokio::sync::oneshot::channel::<()>();
        std::thread::spawn(move || {
            let _ = stop.receiver().recv();
            let _ = cancel_publisher.send(());
        });

        let metrics = web::Data::from(self.metrics.clone());
        let bind_target = (self.listen_addr.clone(), self.listen_port);

        runtime.block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(metrics.clone())
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .workers(1)
            .bind(bind_target);

            let server = match server {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = startup_publisher.send(Err(err.to_string()));
                    return;
                }
            };
            let _ = startup_publisher.send(Ok(()));

            tokio::select! {
                result = server => {
                    if let Err(err) = result {
                        error!(error_msg = %err, "exposition endpoint failed");
                    }
                }
                _ = cancel_consumer => info!("exposition endpoint stopped"),
            }
        });
    }
}

async fn metrics_handler(metrics: web::Data<Metrics>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(OPENMETRICS_CONTENT_TYPE)
        .body(metrics.encode())
}
