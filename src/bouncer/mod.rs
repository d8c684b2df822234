//! Top-level orchestrator.
//!
//! Owns one [AccountRuntime] per configured account and drives the lifecycle:
//! purge stale resources, provision fresh ones, start the background tasks
//! (rotators, metrics reporter, exposition endpoint), then consume the LAPI
//! stream on the configured tick. Every batch is fanned out to all accounts
//! in parallel; a failing account never affects its peers. On shutdown the
//! children are stopped first and teardown runs outside the cancelled scope.

use crate::cloudflare::CloudflareApi;
use crate::cloudflare::client::CloudflareClient;
use crate::config::{AccountConfig, BouncerConfig, PrometheusConfig, ZoneConfig};
use crate::crowdsec::stream::{
    DecisionSet, DecisionSource, StreamClient, StreamError, StreamResponse,
};
use crate::event::ApplicationEvent;
use crate::http::client::{HttpBuildError, build_client};
use crate::http::config::HttpConfig;
use crate::infra::{InfraError, InfraManager};
use crate::metrics::Metrics;
use crate::metrics::reporter::{MetricsReporter, ReporterTarget};
use crate::metrics::server::{ExpositionError, ExpositionServer};
use crate::reconciler::{AccountReconciler, log_cycle_failure};
use crate::turnstile::{TurnstileError, TurnstileManager, TurnstileZone};
use crate::utils::background::BackgroundJob;
use crossbeam::channel::{Receiver, tick};
use crossbeam::select;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BouncerError {
    #[error("could not build an http client: {0}")]
    Http(#[from] HttpBuildError),

    #[error("could not build the decision stream client: {0}")]
    Stream(#[from] StreamError),

    #[error("account `{account}`: provisioning failed: {err}")]
    Provision { account: String, err: InfraError },

    #[error("account `{account}`: turnstile bootstrap failed: {err}")]
    Turnstile {
        account: String,
        err: TurnstileError,
    },

    #[error("account `{account}`: teardown failed: {err}")]
    Teardown { account: String, err: InfraError },

    #[error(transparent)]
    Exposition(#[from] ExpositionError),
}

/// Everything one account needs at runtime. The reconciler and the Turnstile
/// manager exist once provisioning succeeded.
struct AccountRuntime<C: CloudflareApi> {
    api: Arc<C>,
    infra: InfraManager<C>,
    reconciler: Option<AccountReconciler<C>>,
    turnstile: Option<Arc<TurnstileManager<C>>>,
    turnstile_zones: Vec<TurnstileZone>,
    metrics_db_id: Option<String>,
}

impl<C: CloudflareApi> AccountRuntime<C> {
    fn new(api: Arc<C>, account: AccountConfig) -> Self {
        Self {
            infra: InfraManager::new(api.clone(), account),
            api,
            reconciler: None,
            turnstile: None,
            turnstile_zones: Vec::new(),
            metrics_db_id: None,
        }
    }

    fn account_name(&self) -> String {
        self.infra.account().display_name().to_string()
    }

    /// Startup lifecycle of one account: purge stale resources, provision
    /// fresh ones, bootstrap Turnstile and probe the warmup sentinel.
    fn provision(&mut self, metrics: Arc<Metrics>) -> Result<(), BouncerError> {
        let account = self.account_name();

        if let Err(err) = self.infra.teardown() {
            warn!(
                account = %account,
                error_msg = %err,
                "stale resource purge was incomplete, provisioning anyway"
            );
        }

        let provisioned = self
            .infra
            .provision()
            .map_err(|err| BouncerError::Provision {
                account: account.clone(),
                err,
            })?;

        let mut reconciler = AccountReconciler::new(
            self.api.clone(),
            account.clone(),
            provisioned.namespace_id.clone(),
            metrics,
        );
        reconciler
            .probe_warmed_up()
            .map_err(|err| BouncerError::Provision {
                account: account.clone(),
                err: err.into(),
            })?;

        let turnstile_zones =
            turnstile_zones(&self.infra.account().zones, &provisioned.domains_by_zone);
        if !turnstile_zones.is_empty() {
            let manager = Arc::new(TurnstileManager::new(
                self.api.clone(),
                account.clone(),
                provisioned.namespace_id.clone(),
            ));
            manager
                .bootstrap(&turnstile_zones)
                .map_err(|err| BouncerError::Turnstile {
                    account: account.clone(),
                    err,
                })?;
            self.turnstile = Some(manager);
        }

        self.reconciler = Some(reconciler);
        self.turnstile_zones = turnstile_zones;
        self.metrics_db_id = provisioned.metrics_db_id;
        info!(account = %account, "account provisioned");
        Ok(())
    }
}

/// Projects the Turnstile-enabled zones of an account onto their domains.
fn turnstile_zones(
    zones: &[ZoneConfig],
    domains_by_zone: &HashMap<String, String>,
) -> Vec<TurnstileZone> {
    zones
        .iter()
        .filter(|zone| zone.turnstile.enabled)
        .filter_map(|zone| {
            domains_by_zone.get(&zone.zone_id).map(|domain| TurnstileZone {
                domain: domain.clone(),
                mode: zone.turnstile.mode,
                rotate_secret: zone.turnstile.rotate_secret_key,
                rotation_interval: zone.turnstile.rotate_secret_key_every.into(),
            })
        })
        .collect()
}

pub struct Bouncer<C: CloudflareApi + 'static, S: DecisionSource> {
    accounts: Vec<AccountRuntime<C>>,
    source: S,
    update_frequency: Duration,
    prometheus: PrometheusConfig,
    metrics: Arc<Metrics>,
}

impl Bouncer<CloudflareClient, StreamClient> {
    /// Assembles the production bouncer: one REST client per account and the
    /// LAPI stream client, both on blocking reqwest.
    pub fn try_from_config(
        config: &BouncerConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BouncerError> {
        let crowdsec = &config.crowdsec_config;
        let lapi_http = build_client(
            &HttpConfig::default().with_client_auth(crowdsec.client_auth()),
        )?;
        let source = StreamClient::new(lapi_http, &crowdsec.lapi_url, &crowdsec.lapi_key)?
            .with_filters(
                &crowdsec.only_include_decisions_from,
                &crowdsec.include_scenarios_containing,
                &crowdsec.exclude_scenarios_containing,
            );

        let mut accounts = Vec::new();
        for account in &config.cloudflare_config.accounts {
            let http = build_client(&HttpConfig::default())?;
            let api = Arc::new(CloudflareClient::new(
                http,
                &account.token,
                &account.id,
                account.display_name(),
                metrics.clone(),
            ));
            accounts.push(AccountRuntime::new(api, account.clone()));
        }

        Ok(Bouncer {
            accounts,
            source,
            update_frequency: crowdsec.update_frequency.into(),
            prometheus: config.prometheus.clone(),
            metrics,
        })
    }
}

impl<C: CloudflareApi + 'static, S: DecisionSource> Bouncer<C, S> {
    #[cfg(test)]
    fn with_parts(
        accounts: Vec<(Arc<C>, AccountConfig)>,
        source: S,
        update_frequency: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|(api, account)| AccountRuntime::new(api, account))
                .collect(),
            source,
            update_frequency,
            prometheus: PrometheusConfig::default(),
            metrics,
        }
    }

    /// Runs until a stop event arrives, then tears everything down.
    pub fn run(
        mut self,
        application_events: Receiver<ApplicationEvent>,
    ) -> Result<(), BouncerError> {
        self.provision_all()?;

        let mut children: Vec<BackgroundJob> = Vec::new();
        for runtime in &self.accounts {
            if let Some(turnstile) = &runtime.turnstile {
                children.extend(turnstile.start_rotators(&runtime.turnstile_zones));
            }
        }

        let reporter_targets: Vec<ReporterTarget<C>> = self
            .accounts
            .iter()
            .filter_map(|runtime| {
                runtime.metrics_db_id.as_ref().map(|db_id| ReporterTarget {
                    account_name: runtime.account_name(),
                    api: runtime.api.clone(),
                    database_id: db_id.clone(),
                })
            })
            .collect();
        if !reporter_targets.is_empty() {
            children.push(
                MetricsReporter::new(
                    reporter_targets,
                    self.metrics.clone(),
                    self.update_frequency,
                )
                .start(),
            );
        }

        if self.prometheus.enabled {
            children.push(
                ExpositionServer::new(&self.prometheus, self.metrics.clone()).start()?,
            );
        }

        info!("bouncer is running");
        let ticker = tick(self.update_frequency);
        self.run_cycle();
        loop {
            select! {
                recv(ticker) -> _ => self.run_cycle(),
                recv(application_events) -> _ => {
                    info!("stop requested, shutting down");
                    break;
                }
            }
        }

        for child in children {
            let name = child.name().to_string();
            if let Err(err) = child.shutdown() {
                error!(thread = %name, error_msg = %err, "background job did not stop cleanly");
            }
        }

        self.teardown_all()
    }

    /// Purges stale resources and provisions every account, concurrently.
    fn provision_all(&mut self) -> Result<(), BouncerError> {
        let metrics = self.metrics.clone();
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .accounts
                .iter_mut()
                .map(|runtime| {
                    let metrics = metrics.clone();
                    scope.spawn(move || runtime.provision(metrics))
                })
                .collect();
            handles
                .into_iter()
                .try_for_each(|handle| handle.join().expect("provisioning thread panicked"))
        })
    }

    /// One stream cycle: fetch and dispatch. Errors are surfaced to the next
    /// tick; nothing retries in place.
    fn run_cycle(&mut self) {
        let startup = self.accounts.iter().any(|runtime| {
            runtime
                .reconciler
                .as_ref()
                .is_some_and(|reconciler| !reconciler.warmed_up())
        });
        match self.source.fetch(startup) {
            Ok(StreamResponse::Batch(batch)) => self.dispatch(&batch),
            Ok(StreamResponse::Reset) => self.reset_all(),
            Err(err) => {
                warn!(error_msg = %err, "decision stream fetch failed, retrying on the next tick")
            }
        }
    }

    /// Fans a batch out to every account in parallel. A failing reconciler is
    /// logged and skipped; its peers are unaffected.
    fn dispatch(&mut self, batch: &DecisionSet) {
        if batch.is_empty() {
            debug!("stream returned no changes");
            return;
        }
        info!(
            new = batch.new.len(),
            deleted = batch.deleted.len(),
            "applying decision batch"
        );
        thread::scope(|scope| {
            for runtime in self.accounts.iter_mut() {
                scope.spawn(move || {
                    if let Some(reconciler) = runtime.reconciler.as_mut() {
                        if let Err(err) = reconciler.reconcile(batch) {
                            log_cycle_failure(reconciler.account_name(), &err);
                        }
                    }
                });
            }
        });
    }

    /// Upstream holds no decisions: purge every account's namespace.
    fn reset_all(&mut self) {
        thread::scope(|scope| {
            for runtime in self.accounts.iter_mut() {
                scope.spawn(move || {
                    if let Some(reconciler) = runtime.reconciler.as_mut() {
                        if let Err(err) = reconciler.reset() {
                            log_cycle_failure(reconciler.account_name(), &err);
                        }
                    }
                });
            }
        });
    }

    /// Deletes the provisioned resources of every account, concurrently.
    /// All accounts are attempted; the first failure is returned.
    pub fn teardown_all(&self) -> Result<(), BouncerError> {
        info!("tearing down provisioned resources");
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .accounts
                .iter()
                .map(|runtime| {
                    scope.spawn(move || {
                        runtime
                            .infra
                            .teardown()
                            .map_err(|err| BouncerError::Teardown {
                                account: runtime.account_name(),
                                err,
                            })
                    })
                })
                .collect();
            handles
                .into_iter()
                .try_for_each(|handle| handle.join().expect("teardown thread panicked"))
        })
    }

    /// Provision-and-exit flow (`-s`).
    pub fn provision_only(&mut self) -> Result<(), BouncerError> {
        self.provision_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::MockCloudflareApi;
    use crate::cloudflare::types::KvNamespace;
    use crate::config::Action;
    use crate::crowdsec::decision::{Decision, Scope};
    use crate::crowdsec::stream::MockDecisionSource;
    use crate::defaults::{KEY_RESET, KEY_WARMED_UP, KV_NAMESPACE_TITLE};
    use crate::event::application_channel;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::thread::sleep;

    fn account() -> AccountConfig {
        AccountConfig {
            id: "acc1".into(),
            token: "tok1".into(),
            account_name: "acme".into(),
            ban_template: None,
            zones: vec![ZoneConfig {
                zone_id: "z1".into(),
                actions: vec![Action::Ban],
                default_action: Action::Ban,
                routes_to_protect: vec![],
                turnstile: Default::default(),
            }],
        }
    }

    /// Mocks the full account lifecycle: stale purge, provisioning, one
    /// decision write and the shutdown teardown.
    fn lifecycle_mock() -> MockCloudflareApi {
        let mut mock = MockCloudflareApi::new();

        // teardown runs twice: before provisioning and at shutdown
        mock.expect_list_turnstile_widgets()
            .times(2)
            .returning(|| Ok(vec![]));
        mock.expect_list_worker_routes().returning(|_| Ok(vec![]));
        mock.expect_delete_worker()
            .times(2)
            .returning(|_| Err(crate::cloudflare::error::ApiError::NotFound("gone".into())));
        mock.expect_list_kv_namespaces().times(2).returning(|| Ok(vec![]));
        mock.expect_list_metrics_dbs().times(2).returning(|| Ok(vec![]));

        // provisioning
        mock.expect_list_zones().returning(|| {
            Ok(vec![crate::cloudflare::types::Zone {
                id: "z1".into(),
                name: "example.com".into(),
            }])
        });
        mock.expect_create_kv_namespace().times(1).returning(|_| {
            Ok(KvNamespace {
                id: "ns1".into(),
                title: KV_NAMESPACE_TITLE.into(),
            })
        });
        mock.expect_create_metrics_db()
            .returning(|_| Err(crate::cloudflare::error::ApiError::Auth("no d1".into())));
        mock.expect_upload_worker().times(1).returning(|_, _, _| Ok(()));

        // warmup probe and reset sentinel
        mock.expect_read_keys()
            .withf(|_, keys| keys == [KEY_WARMED_UP.to_string()])
            .returning(|_, _| Ok(HashMap::new()));
        mock.expect_read_keys()
            .withf(|_, keys| keys == [KEY_RESET.to_string()])
            .returning(|_, _| Ok(HashMap::new()));

        mock
    }

    #[test]
    fn run_provisions_dispatches_and_tears_down() {
        let mut mock = lifecycle_mock();

        // BAN_TEMPLATE during provisioning, the decision batch and WARMED_UP
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        mock.expect_write_key_value_pairs().returning(move |_, pairs| {
            sink.lock()
                .unwrap()
                .extend(pairs.iter().map(|p| p.key.clone()));
            Ok(())
        });

        let mut source = MockDecisionSource::new();
        // the first fetch is the startup snapshot
        source
            .expect_fetch()
            .withf(|startup| *startup)
            .times(1)
            .returning(|_| {
                Ok(StreamResponse::Batch(DecisionSet {
                    new: vec![Decision {
                        scope: Scope::Ip,
                        remediation: "ban".into(),
                        value: "1.2.3.4".into(),
                        origin: "crowdsec".into(),
                        scenario: "probing".into(),
                        duration: "4h".into(),
                    }],
                    deleted: vec![],
                }))
            });
        // later fetches are incremental and empty
        source
            .expect_fetch()
            .withf(|startup| !*startup)
            .returning(|_| Ok(StreamResponse::Batch(DecisionSet::default())));

        let bouncer = Bouncer::with_parts(
            vec![(Arc::new(mock), account())],
            source,
            Duration::from_millis(20),
            Arc::new(Metrics::default()),
        );

        let (stop_sender, stop_receiver) = application_channel();
        let runner = std::thread::spawn(move || bouncer.run(stop_receiver));

        sleep(Duration::from_millis(120));
        stop_sender.send(ApplicationEvent::StopRequested).unwrap();
        runner.join().unwrap().unwrap();

        let written = written.lock().unwrap();
        assert!(written.contains(&"BAN_TEMPLATE".to_string()));
        assert!(written.contains(&"1.2.3.4".to_string()));
        assert!(written.contains(&KEY_WARMED_UP.to_string()));
    }

    #[test]
    fn reset_response_purges_every_account() {
        let mut mock = lifecycle_mock();
        mock.expect_write_key_value_pairs().returning(|_, _| Ok(()));
        // the purge lists and deletes the namespace content
        mock.expect_list_keys().returning(|_, _| {
            Ok(crate::cloudflare::types::KeyListPage {
                keys: vec!["1.2.3.4".into(), "BAN_TEMPLATE".into()],
                cursor: None,
            })
        });
        mock.expect_delete_keys()
            .withf(|_, keys| keys == ["1.2.3.4".to_string()])
            .times(1..)
            .returning(|_, _| Ok(()));

        let mut source = MockDecisionSource::new();
        source
            .expect_fetch()
            .returning(|_| Ok(StreamResponse::Reset));

        let bouncer = Bouncer::with_parts(
            vec![(Arc::new(mock), account())],
            source,
            Duration::from_millis(500),
            Arc::new(Metrics::default()),
        );

        let (stop_sender, stop_receiver) = application_channel();
        let runner = std::thread::spawn(move || bouncer.run(stop_receiver));
        sleep(Duration::from_millis(100));
        stop_sender.send(ApplicationEvent::StopRequested).unwrap();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn provisioning_failure_is_fatal() {
        let mut mock = MockCloudflareApi::new();
        mock.expect_list_turnstile_widgets().returning(|| Ok(vec![]));
        mock.expect_list_worker_routes().returning(|_| Ok(vec![]));
        mock.expect_delete_worker()
            .returning(|_| Err(crate::cloudflare::error::ApiError::NotFound("gone".into())));
        mock.expect_list_kv_namespaces().returning(|| Ok(vec![]));
        mock.expect_list_metrics_dbs().returning(|| Ok(vec![]));
        mock.expect_list_zones().returning(|| Ok(vec![]));

        let bouncer = Bouncer::with_parts(
            vec![(Arc::new(mock), account())],
            MockDecisionSource::new(),
            Duration::from_millis(500),
            Arc::new(Metrics::default()),
        );

        let (_stop_sender, stop_receiver) = application_channel();
        let err = bouncer.run(stop_receiver).unwrap_err();
        assert!(matches!(
            err,
            BouncerError::Provision { account, err: InfraError::UnknownZone(_) } if account == "acme"
        ));
    }
}
