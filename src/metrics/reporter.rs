//! Periodic collector for the edge-side request metrics.
//!
//! The enforcement worker upserts counters into each account's metrics
//! database. The reporter polls those tables, computes per-row deltas against
//! the process-lifetime last-observed cache and feeds the deltas into the
//! Prometheus families. The cache is never reset.

use super::{Metrics, ProcessedLabels, TrafficLabels};
use crate::cloudflare::CloudflareApi;
use crate::defaults::{METRIC_NAME_DROPPED, METRIC_NAME_PROCESSED};
use crate::utils::background::BackgroundJob;
use crossbeam::channel::tick;
use crossbeam::select;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const METRICS_QUERY: &str =
    "SELECT val, metric_name, origin, remediation_type, ip_type FROM metrics";

/// One account's metrics database.
pub struct ReporterTarget<C> {
    pub account_name: String,
    pub api: Arc<C>,
    pub database_id: String,
}

#[derive(Debug, Deserialize)]
struct MetricsRow {
    #[serde(default = "default_val")]
    val: i64,
    metric_name: String,
    #[serde(default)]
    origin: String,
    #[serde(default)]
    remediation_type: String,
    #[serde(default)]
    ip_type: String,
}

fn default_val() -> i64 {
    1
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RowKey {
    account: String,
    metric_name: String,
    origin: String,
    remediation_type: String,
    ip_type: String,
}

pub struct MetricsReporter<C> {
    targets: Vec<ReporterTarget<C>>,
    metrics: Arc<Metrics>,
    interval: Duration,
    last_observed: HashMap<RowKey, i64>,
}

impl<C: CloudflareApi + 'static> MetricsReporter<C> {
    pub fn new(
        targets: Vec<ReporterTarget<C>>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            targets,
            metrics,
            interval,
            last_observed: HashMap::new(),
        }
    }

    pub fn start(mut self) -> BackgroundJob {
        let ticker = tick(self.interval);
        BackgroundJob::spawn("metrics-reporter", move |stop| {
            loop {
                select! {
                    recv(ticker) -> _ => self.collect(),
                    recv(stop.receiver()) -> _ => break,
                }
            }
        })
    }

    /// Queries every target once and applies the positive deltas.
    fn collect(&mut self) {
        for target in &self.targets {
            let result = target
                .api
                .query_metrics_db(&target.database_id, METRICS_QUERY, &[]);
            let rows = match result {
                Ok(query_result) => query_result.results,
                Err(err) => {
                    warn!(
                        account = %target.account_name,
                        error_msg = %err,
                        "could not query the metrics database"
                    );
                    continue;
                }
            };

            for row in rows {
                let row: MetricsRow = match serde_json::from_value(row) {
                    Ok(row) => row,
                    Err(err) => {
                        debug!(error_msg = %err, "skipping undecodable metrics row");
                        continue;
                    }
                };
                let key = RowKey {
                    account: target.account_name.clone(),
                    metric_name: row.metric_name.clone(),
                    origin: row.origin.clone(),
                    remediation_type: row.remediation_type.clone(),
                    ip_type: row.ip_type.clone(),
                };
                let previous = self.last_observed.insert(key, row.val).unwrap_or(0);
                let delta = row.val - previous;
                if delta <= 0 {
                    continue;
                }

                match row.metric_name.as_str() {
                    METRIC_NAME_DROPPED => {
                        self.metrics
                            .blocked_requests
                            .get_or_create(&TrafficLabels {
                                origin: row.origin,
                                ip_type: row.ip_type,
                                account: target.account_name.clone(),
                                remediation: row.remediation_type,
                            })
                            .inc_by(delta);
                    }
                    METRIC_NAME_PROCESSED => {
                        self.metrics
                            .processed_requests
                            .get_or_create(&ProcessedLabels {
                                ip_type: row.ip_type,
                                account: target.account_name.clone(),
                            })
                            .inc_by(delta);
                    }
                    other => debug!(metric_name = %other, "ignoring unknown metric row"),
                }
            }
        }
    }
}
