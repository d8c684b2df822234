//! Per-account provisioning and teardown of the edge resources.
//!
//! Provisioning follows a fixed order: KV namespace, metrics database (best
//! effort), ban template, worker upload, route binds. Teardown walks the
//! resource types in reverse dependency order, matching resources by their
//! configured names, and tolerates a missing worker script.

use crate::cloudflare::CloudflareApi;
use crate::cloudflare::error::ApiError;
use crate::cloudflare::types::{KvPair, WorkerBinding};
use crate::config::{AccountConfig, ZoneConfig};
use crate::defaults::{
    ACTIONS_BINDING_NAME, DEFAULT_BAN_TEMPLATE, KEY_BAN_TEMPLATE, KV_BINDING_NAME,
    KV_NAMESPACE_TITLE, METRICS_DB_BINDING_NAME, METRICS_DB_NAME, METRICS_TABLE_DDL,
    WIDGET_NAME, WORKER_SCRIPT_NAME,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// The enforcement worker bundle, uploaded as-is.
const WORKER_SCRIPT: &str = include_str!("../../assets/worker.js");

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("zone `{0}` does not exist in this Cloudflare account")]
    UnknownZone(String),

    #[error("could not read ban template `{path}`: {err}")]
    BanTemplate { path: String, err: String },

    #[error("cloudflare api: {0}")]
    Api(#[from] ApiError),
}

/// Identifiers of the resources created for one account.
#[derive(Debug, Clone)]
pub struct ProvisionedInfra {
    pub namespace_id: String,
    /// Absent when the plan does not allow D1: the worker then runs without
    /// metrics.
    pub metrics_db_id: Option<String>,
    /// zone id to apex domain, resolved once at provision time.
    pub domains_by_zone: HashMap<String, String>,
}

pub struct InfraManager<C> {
    api: Arc<C>,
    account: AccountConfig,
}

impl<C: CloudflareApi> InfraManager<C> {
    pub fn new(api: Arc<C>, account: AccountConfig) -> Self {
        Self { api, account }
    }

    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    /// Provisions all edge resources in order. Any failure except the metrics
    /// database is fatal; the operator must intervene.
    pub fn provision(&self) -> Result<ProvisionedInfra, InfraError> {
        let domains_by_zone = self.resolve_zones()?;

        let namespace = self.api.create_kv_namespace(KV_NAMESPACE_TITLE)?;
        info!(
            account = %self.account.display_name(),
            namespace_id = %namespace.id,
            "created KV namespace"
        );

        let metrics_db_id = self.create_metrics_db();

        self.api.write_key_value_pairs(
            &namespace.id,
            &[KvPair::new(KEY_BAN_TEMPLATE, self.load_ban_template()?)],
        )?;

        let mut bindings = vec![
            WorkerBinding::KvNamespace {
                name: KV_BINDING_NAME.to_string(),
                namespace_id: namespace.id.clone(),
            },
            WorkerBinding::PlainText {
                name: ACTIONS_BINDING_NAME.to_string(),
                text: actions_by_domain(&self.account.zones, &domains_by_zone),
            },
        ];
        if let Some(db_id) = &metrics_db_id {
            bindings.push(WorkerBinding::D1 {
                name: METRICS_DB_BINDING_NAME.to_string(),
                id: db_id.clone(),
            });
        }
        self.api
            .upload_worker(WORKER_SCRIPT_NAME, WORKER_SCRIPT, &bindings)?;

        for zone in &self.account.zones {
            for pattern in &zone.routes_to_protect {
                let route_id = self.api.create_worker_route(
                    &zone.zone_id,
                    pattern,
                    WORKER_SCRIPT_NAME,
                    true,
                )?;
                debug!(zone = %zone.zone_id, pattern = %pattern, route_id = %route_id, "bound worker route");
            }
        }

        Ok(ProvisionedInfra {
            namespace_id: namespace.id,
            metrics_db_id,
            domains_by_zone,
        })
    }

    /// Deletes every resource matching the configured names: widgets, then
    /// worker routes, the worker script, the KV namespace and the metrics
    /// database. A missing worker script is expected; any other failure is
    /// reported, and the remaining resource types are still attempted.
    pub fn teardown(&self) -> Result<(), InfraError> {
        let account = self.account.display_name();
        let mut first_err: Option<InfraError> = None;

        let widgets = self.record_err(&mut first_err, self.api.list_turnstile_widgets());
        for widget in widgets.unwrap_or_default() {
            if widget.name == WIDGET_NAME {
                self.record_err(
                    &mut first_err,
                    self.api.delete_turnstile_widget(&widget.sitekey),
                );
            }
        }

        for zone in &self.account.zones {
            let routes =
                self.record_err(&mut first_err, self.api.list_worker_routes(&zone.zone_id));
            for route in routes.unwrap_or_default() {
                if route.script.as_deref() == Some(WORKER_SCRIPT_NAME) {
                    self.record_err(
                        &mut first_err,
                        self.api.delete_worker_route(&zone.zone_id, &route.id),
                    );
                }
            }
        }

        match self.api.delete_worker(WORKER_SCRIPT_NAME) {
            Ok(()) => info!(account = %account, "deleted worker script"),
            Err(err) if err.is_not_found() => {
                debug!(account = %account, "worker script already absent")
            }
            Err(err) => {
                error!(account = %account, error_msg = %err, "teardown step failed");
                first_err.get_or_insert(err.into());
            }
        }

        let namespaces = self.record_err(&mut first_err, self.api.list_kv_namespaces());
        for namespace in namespaces.unwrap_or_default() {
            if namespace.title == KV_NAMESPACE_TITLE {
                self.record_err(&mut first_err, self.api.delete_kv_namespace(&namespace.id));
            }
        }

        let databases = self.record_err(&mut first_err, self.api.list_metrics_dbs());
        for database in databases.unwrap_or_default() {
            if database.name == METRICS_DB_NAME {
                self.record_err(&mut first_err, self.api.delete_metrics_db(&database.uuid));
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves the configured zone ids against the account's zones. A zone
    /// id the account does not own is a configuration error.
    fn resolve_zones(&self) -> Result<HashMap<String, String>, InfraError> {
        let known: HashMap<String, String> = self
            .api
            .list_zones()?
            .into_iter()
            .map(|zone| (zone.id, zone.name))
            .collect();

        let mut domains = HashMap::new();
        for zone in &self.account.zones {
            let domain = known
                .get(&zone.zone_id)
                .ok_or_else(|| InfraError::UnknownZone(zone.zone_id.clone()))?;
            domains.insert(zone.zone_id.clone(), domain.clone());
        }
        Ok(domains)
    }

    /// Metrics are best-effort: creation or schema failures downgrade the
    /// account to "no metrics" instead of failing provisioning.
    fn create_metrics_db(&self) -> Option<String> {
        let db_id = match self.api.create_metrics_db(METRICS_DB_NAME) {
            Ok(db_id) => db_id,
            Err(err) => {
                warn!(
                    account = %self.account.display_name(),
                    error_msg = %err,
                    "could not create the metrics database, continuing without metrics"
                );
                return None;
            }
        };
        if let Err(err) = self.api.query_metrics_db(&db_id, METRICS_TABLE_DDL, &[]) {
            warn!(
                account = %self.account.display_name(),
                error_msg = %err,
                "could not create the metrics schema, continuing without metrics"
            );
            return None;
        }
        Some(db_id)
    }

    fn load_ban_template(&self) -> Result<String, InfraError> {
        match &self.account.ban_template {
            Some(path) => std::fs::read_to_string(path).map_err(|err| InfraError::BanTemplate {
                path: path.to_string_lossy().into(),
                err: err.to_string(),
            }),
            None => Ok(DEFAULT_BAN_TEMPLATE.to_string()),
        }
    }

    fn record_err<T>(
        &self,
        first_err: &mut Option<InfraError>,
        result: Result<T, ApiError>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                error!(
                    account = %self.account.display_name(),
                    error_msg = %err,
                    "teardown step failed"
                );
                first_err.get_or_insert(err.into());
                None
            }
        }
    }
}

/// Serializes the per-domain action map the worker consults on every request.
/// Domains are emitted in sorted order.
fn actions_by_domain(zones: &[ZoneConfig], domains_by_zone: &HashMap<String, String>) -> String {
    let map: BTreeMap<&str, serde_json::Value> = zones
        .iter()
        .filter_map(|zone| {
            domains_by_zone.get(&zone.zone_id).map(|domain| {
                (
                    domain.as_str(),
                    serde_json::json!({
                        "supported_actions": zone
                            .actions
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>(),
                        "default_action": zone.default_action.to_string(),
                    }),
                )
            })
        })
        .collect();
    serde_json::to_string(&map).expect("string map serialization cannot fail")
}
