//! Product-wide constants: resource names, reserved KV keys and API limits.

pub const PRODUCT_NAME: &str = "crowdsec-cloudflare-bouncer";
pub const PRODUCT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_CONFIG_PATH: &str = "/etc/crowdsec/bouncers/crowdsec-cloudflare-bouncer.yaml";

// Names of the per-account Cloudflare resources. They must stay unique within
// a provider account so teardown can find them again by name.
pub const KV_NAMESPACE_TITLE: &str = "crowdsec-cloudflare-bouncer-kv";
pub const WORKER_SCRIPT_NAME: &str = "crowdsec-cloudflare-bouncer-worker";
pub const WIDGET_NAME: &str = "crowdsec-cloudflare-bouncer-widget";
pub const METRICS_DB_NAME: &str = "crowdsec-cloudflare-bouncer-metrics";

// Binding names the enforcement worker resolves at request time.
pub const KV_BINDING_NAME: &str = "KV_NAMESPACE";
pub const ACTIONS_BINDING_NAME: &str = "ACTIONS_BY_DOMAIN";
pub const METRICS_DB_BINDING_NAME: &str = "METRICS_DB";

// Reserved KV keys. Everything else in the namespace is a decision key.
pub const KEY_IP_RANGES: &str = "IP_RANGES";
pub const KEY_BAN_TEMPLATE: &str = "BAN_TEMPLATE";
pub const KEY_TURNSTILE_CONFIG: &str = "TURNSTILE_CONFIG";
pub const KEY_RESET: &str = "RESET";
pub const KEY_WARMED_UP: &str = "WARMED_UP";

/// Keys that survive a reset, whether triggered by the `RESET` sentinel or by
/// an empty upstream (204) response.
pub const PRESERVED_KEYS: [&str; 3] = [KEY_BAN_TEMPLATE, KEY_TURNSTILE_CONFIG, KEY_RESET];

pub const DEFAULT_BAN_TEMPLATE: &str = "Access Denied";

/// Upper bound of entries accepted by the bulk KV write and delete endpoints.
pub const BULK_WRITE_LIMIT: usize = 10_000;
/// Upper bound of keys accepted by the bulk KV read endpoint.
pub const BULK_READ_LIMIT: usize = 100;

pub const METRICS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS metrics(val INTEGER DEFAULT 1, metric_name TEXT, origin TEXT NOT NULL DEFAULT '', remediation_type TEXT NOT NULL DEFAULT '', ip_type TEXT NOT NULL DEFAULT '', UNIQUE(metric_name, origin, remediation_type, ip_type))";

// Row names the enforcement worker upserts into the metrics table.
pub const METRIC_NAME_DROPPED: &str = "dropped";
pub const METRIC_NAME_PROCESSED: &str = "processed";

pub fn user_agent() -> String {
    format!("{PRODUCT_NAME}/{PRODUCT_VERSION}")
}
