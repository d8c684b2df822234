//! Starter-config generation from bare API tokens (the `-g` flow).
//!
//! Each token is used to discover the accounts it can see and their zones;
//! the result is a ready-to-edit configuration with conservative per-zone
//! defaults. The LAPI section is emitted with placeholders the operator fills
//! in.

use super::{
    AccountConfig, Action, BouncerConfig, CloudflareConfig, CrowdsecConfig, TurnstileSettings,
    ZoneConfig, default_update_frequency,
};
use crate::cloudflare::CloudflareApi;
use crate::cloudflare::client::CloudflareClient;
use crate::cloudflare::error::ApiError;
use crate::cloudflare::types::Account;
use crate::http::client::{HttpBuildError, build_client};
use crate::http::config::HttpConfig;
use crate::metrics::Metrics;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use url::Url;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("discovery failed: {0}")]
    Api(#[from] ApiError),

    #[error("could not build the discovery client: {0}")]
    Http(#[from] HttpBuildError),

    #[error("could not render the generated config: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// Builds API clients during discovery. Production uses [LiveClientFactory];
/// tests substitute canned clients.
pub trait ClientFactory {
    /// A client scoped to `account` when one is given; otherwise a bare
    /// client only fit for listing accounts.
    fn client_for(
        &self,
        token: &str,
        account: Option<&Account>,
    ) -> Result<Arc<dyn CloudflareApi>, GeneratorError>;
}

pub struct LiveClientFactory {
    metrics: Arc<Metrics>,
}

impl LiveClientFactory {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Metrics::default()),
        }
    }
}

impl Default for LiveClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for LiveClientFactory {
    fn client_for(
        &self,
        token: &str,
        account: Option<&Account>,
    ) -> Result<Arc<dyn CloudflareApi>, GeneratorError> {
        let http = build_client(&HttpConfig::default())?;
        let (id, name) = account
            .map(|a| (a.id.as_str(), a.name.as_str()))
            .unwrap_or(("", "discovery"));
        Ok(Arc::new(CloudflareClient::new(
            http,
            token,
            id,
            name,
            self.metrics.clone(),
        )))
    }
}

/// Discovers accounts and zones for every token and assembles a starter
/// configuration.
pub fn generate(
    tokens: &[String],
    factory: &dyn ClientFactory,
) -> Result<BouncerConfig, GeneratorError> {
    let mut accounts = Vec::new();
    for token in tokens {
        let discovery = factory.client_for(token, None)?;
        for account in discovery.list_accounts()? {
            info!(account = %account.name, "discovered account");
            let scoped = factory.client_for(token, Some(&account))?;
            let zones = scoped
                .list_zones()?
                .into_iter()
                .map(|zone| ZoneConfig {
                    zone_id: zone.id,
                    actions: vec![Action::Ban],
                    default_action: Action::Ban,
                    routes_to_protect: vec![format!("{}/*", zone.name)],
                    turnstile: TurnstileSettings::default(),
                })
                .collect();
            accounts.push(AccountConfig {
                id: account.id,
                token: token.clone(),
                account_name: account.name,
                ban_template: None,
                zones,
            });
        }
    }

    Ok(BouncerConfig {
        crowdsec_config: CrowdsecConfig {
            lapi_url: Url::parse("http://127.0.0.1:8080/").expect("static url is valid"),
            lapi_key: "<LAPI_KEY>".to_string(),
            update_frequency: default_update_frequency(),
            include_scenarios_containing: Vec::new(),
            exclude_scenarios_containing: Vec::new(),
            only_include_decisions_from: Vec::new(),
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
        },
        cloudflare_config: CloudflareConfig { accounts },
        log_level: Default::default(),
        log_media: Default::default(),
        log_dir: super::default_log_dir(),
        prometheus: Default::default(),
    })
}

/// Renders a configuration back to YAML, for stdout or the `-o` target.
pub fn render_yaml(config: &BouncerConfig) -> Result<String, GeneratorError> {
    Ok(serde_yaml::to_string(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::MockCloudflareApi;
    use crate::cloudflare::types::Zone;

    struct FakeFactory;

    impl ClientFactory for FakeFactory {
        fn client_for(
            &self,
            token: &str,
            account: Option<&Account>,
        ) -> Result<Arc<dyn CloudflareApi>, GeneratorError> {
            assert_eq!(token, "tok1");
            let mut mock = MockCloudflareApi::new();
            match account {
                None => {
                    mock.expect_list_accounts().returning(|| {
                        Ok(vec![Account {
                            id: "acc1".into(),
                            name: "acme".into(),
                        }])
                    });
                }
                Some(account) => {
                    assert_eq!(account.id, "acc1");
                    mock.expect_list_zones().returning(|| {
                        Ok(vec![Zone {
                            id: "z1".into(),
                            name: "example.com".into(),
                        }])
                    });
                }
            }
            Ok(Arc::new(mock))
        }
    }

    #[test]
    fn generated_config_covers_discovered_zones_and_validates() {
        let config = generate(&["tok1".to_string()], &FakeFactory).unwrap();

        assert_eq!(config.cloudflare_config.accounts.len(), 1);
        let account = &config.cloudflare_config.accounts[0];
        assert_eq!(account.id, "acc1");
        assert_eq!(account.token, "tok1");
        assert_eq!(account.zones.len(), 1);
        assert_eq!(account.zones[0].zone_id, "z1");
        assert_eq!(
            account.zones[0].routes_to_protect,
            vec!["example.com/*".to_string()]
        );

        // the starter config must itself pass validation
        config.validate().unwrap();

        let rendered = render_yaml(&config).unwrap();
        assert!(rendered.contains("lapi_key: <LAPI_KEY>"));
        assert!(rendered.contains("zone_id: z1"));
    }
}
