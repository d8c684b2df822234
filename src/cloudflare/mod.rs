//! Typed capability surface over the Cloudflare REST API.
//!
//! The [CloudflareApi] trait is the seam between the reconciliation logic and
//! the provider: production code uses [client::CloudflareClient], tests
//! substitute the generated mock.

pub mod client;
pub mod error;
pub mod types;

use std::collections::HashMap;

use error::ApiError;
use types::{
    Account, D1QueryResult, KeyListPage, KvNamespace, KvPair, MetricsDb, TurnstileWidget,
    WidgetMode, WidgetTokens, WorkerBinding, WorkerRoute, Zone,
};

#[cfg_attr(test, mockall::automock)]
pub trait CloudflareApi: Send + Sync {
    // Accounts and zones
    fn list_accounts(&self) -> Result<Vec<Account>, ApiError>;
    fn list_zones(&self) -> Result<Vec<Zone>, ApiError>;

    // KV namespaces
    fn list_kv_namespaces(&self) -> Result<Vec<KvNamespace>, ApiError>;
    fn create_kv_namespace(&self, title: &str) -> Result<KvNamespace, ApiError>;
    fn delete_kv_namespace(&self, namespace_id: &str) -> Result<(), ApiError>;

    /// Writes up to 10 000 pairs in one call. Larger inputs must be split by
    /// the caller.
    fn write_key_value_pairs(&self, namespace_id: &str, pairs: &[KvPair]) -> Result<(), ApiError>;
    /// Deletes up to 10 000 keys in one call. Larger inputs must be split by
    /// the caller.
    fn delete_keys(&self, namespace_id: &str, keys: &[String]) -> Result<(), ApiError>;
    /// Reads up to 100 keys in one call. Keys absent remotely are absent from
    /// the returned map.
    fn read_keys(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, ApiError>;
    fn list_keys<'a>(&self, namespace_id: &str, cursor: Option<&'a str>)
    -> Result<KeyListPage, ApiError>;

    // Worker script and routes
    fn upload_worker(
        &self,
        script_name: &str,
        script: &str,
        bindings: &[WorkerBinding],
    ) -> Result<(), ApiError>;
    fn delete_worker(&self, script_name: &str) -> Result<(), ApiError>;
    fn list_worker_routes(&self, zone_id: &str) -> Result<Vec<WorkerRoute>, ApiError>;
    fn create_worker_route(
        &self,
        zone_id: &str,
        pattern: &str,
        script_name: &str,
        fail_open: bool,
    ) -> Result<String, ApiError>;
    fn delete_worker_route(&self, zone_id: &str, route_id: &str) -> Result<(), ApiError>;

    // Turnstile widgets
    fn create_turnstile_widget(
        &self,
        name: &str,
        domains: &[String],
        mode: WidgetMode,
    ) -> Result<WidgetTokens, ApiError>;
    fn list_turnstile_widgets(&self) -> Result<Vec<TurnstileWidget>, ApiError>;
    fn rotate_turnstile_secret(
        &self,
        site_key: &str,
        invalidate_immediately: bool,
    ) -> Result<String, ApiError>;
    fn delete_turnstile_widget(&self, site_key: &str) -> Result<(), ApiError>;

    // Metrics database
    fn create_metrics_db(&self, name: &str) -> Result<String, ApiError>;
    fn list_metrics_dbs(&self) -> Result<Vec<MetricsDb>, ApiError>;
    fn query_metrics_db(
        &self,
        database_id: &str,
        sql: &str,
        params: &[String],
    ) -> Result<D1QueryResult, ApiError>;
    fn delete_metrics_db(&self, database_id: &str) -> Result<(), ApiError>;
}
