//! Prometheus metric set exposed by the synchronizer.
//!
//! Counters and gauges are grouped in a single [Metrics] value that owns the
//! registry. It is created once at startup and shared behind an [Arc];
//! families are never reset for the lifetime of the process.

pub mod reporter;
pub mod server;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AccountLabels {
    pub account: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub origin: String,
    pub ip_type: String,
    pub scope: String,
    pub account: String,
    pub remediation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TrafficLabels {
    pub origin: String,
    pub ip_type: String,
    pub account: String,
    pub remediation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProcessedLabels {
    pub ip_type: String,
    pub account: String,
}

pub struct Metrics {
    registry: Registry,
    /// Incremented on every Cloudflare HTTP request, successful or not.
    pub api_calls: Family<AccountLabels, Counter>,
    /// Number of decision-bearing keys currently mirrored in each namespace.
    pub keys_total: Family<AccountLabels, Gauge>,
    /// Active decisions by origin/scope/remediation, recomputed each cycle.
    pub active_decisions: Family<DecisionLabels, Gauge>,
    /// Requests blocked by the enforcement worker, fed from the metrics DB.
    pub blocked_requests: Family<TrafficLabels, Gauge>,
    /// Requests seen by the enforcement worker, fed from the metrics DB.
    pub processed_requests: Family<ProcessedLabels, Gauge>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();

        let api_calls = Family::<AccountLabels, Counter>::default();
        registry.register(
            "cloudflare_api_calls",
            "Number of Cloudflare API calls issued",
            api_calls.clone(),
        );

        let keys_total = Family::<AccountLabels, Gauge>::default();
        registry.register(
            "cloudflare_keys_total",
            "Number of decision keys held in the KV namespace",
            keys_total.clone(),
        );

        let active_decisions = Family::<DecisionLabels, Gauge>::default();
        registry.register(
            "active_decisions",
            "Active remediation decisions",
            active_decisions.clone(),
        );

        let blocked_requests = Family::<TrafficLabels, Gauge>::default();
        registry.register(
            "blocked_requests",
            "Requests remediated at the edge",
            blocked_requests.clone(),
        );

        let processed_requests = Family::<ProcessedLabels, Gauge>::default();
        registry.register(
            "processed_requests",
            "Requests inspected at the edge",
            processed_requests.clone(),
        );

        Self {
            registry,
            api_calls,
            keys_total,
            active_decisions,
            blocked_requests,
            processed_requests,
        }
    }
}

impl Metrics {
    pub fn inc_api_calls(&self, account: &str) {
        self.api_calls
            .get_or_create(&AccountLabels {
                account: account.to_string(),
            })
            .inc();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("writing to a String cannot fail");
        buffer
    }
}
