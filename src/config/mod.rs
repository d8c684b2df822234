//! Configuration document of the synchronizer.
//!
//! The YAML layout mirrors what operators of the CrowdSec ecosystem expect:
//! a `crowdsec_config` block for the LAPI side, a `cloudflare_config` block
//! with one entry per account, and top-level logging and Prometheus settings.
//! Semantic validation happens in [BouncerConfig::validate]; everything it
//! rejects is fatal at startup.

pub mod generator;
pub mod logging;

use crate::cloudflare::types::WidgetMode;
use crate::http::config::TlsClientAuth;
use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {err}")]
    Read { path: String, err: String },

    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("crowdsec_config.lapi_key must not be empty")]
    MissingLapiKey,

    #[error("account `{account}` carries no API token")]
    MissingToken { account: String },

    #[error("zone `{zone}` declares no actions")]
    NoActions { zone: String },

    #[error("zone `{zone}`: default action `{action}` is not in the zone's action set")]
    DefaultActionNotSupported { zone: String, action: Action },

    #[error("zone `{zone}`: the captcha action requires turnstile to be enabled")]
    CaptchaRequiresTurnstile { zone: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BouncerConfig {
    pub crowdsec_config: CrowdsecConfig,
    pub cloudflare_config: CloudflareConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_media: LogMedia,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

impl BouncerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_string_lossy().into(),
            err: err.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BouncerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crowdsec_config.lapi_key.is_empty() {
            return Err(ConfigError::MissingLapiKey);
        }
        for account in &self.cloudflare_config.accounts {
            if account.token.is_empty() {
                return Err(ConfigError::MissingToken {
                    account: account.display_name().to_string(),
                });
            }
            for zone in &account.zones {
                if zone.actions.is_empty() {
                    return Err(ConfigError::NoActions {
                        zone: zone.zone_id.clone(),
                    });
                }
                if !zone.actions.contains(&zone.default_action) {
                    return Err(ConfigError::DefaultActionNotSupported {
                        zone: zone.zone_id.clone(),
                        action: zone.default_action,
                    });
                }
                if zone.actions.contains(&Action::Captcha) && !zone.turnstile.enabled {
                    return Err(ConfigError::CaptchaRequiresTurnstile {
                        zone: zone.zone_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CrowdsecConfig {
    pub lapi_url: Url,
    pub lapi_key: String,
    #[serde(default = "default_update_frequency")]
    pub update_frequency: HumanDuration,
    #[serde(default)]
    pub include_scenarios_containing: Vec<String>,
    #[serde(default)]
    pub exclude_scenarios_containing: Vec<String>,
    #[serde(default)]
    pub only_include_decisions_from: Vec<String>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

impl CrowdsecConfig {
    /// Mutual-TLS material for the LAPI client, when both halves are set.
    pub fn client_auth(&self) -> Option<TlsClientAuth> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert_path), Some(key_path)) => Some(TlsClientAuth {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
                ca_cert_path: self.ca_cert_path.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CloudflareConfig {
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AccountConfig {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub account_name: String,
    /// Optional path to a custom HTML ban page.
    #[serde(default)]
    pub ban_template: Option<PathBuf>,
    pub zones: Vec<ZoneConfig>,
}

impl AccountConfig {
    /// Human-facing account label, falling back to the account id.
    pub fn display_name(&self) -> &str {
        if self.account_name.is_empty() {
            &self.id
        } else {
            &self.account_name
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ZoneConfig {
    pub zone_id: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub default_action: Action,
    #[serde(default)]
    pub routes_to_protect: Vec<String>,
    #[serde(default)]
    pub turnstile: TurnstileSettings,
}

/// Remediations a zone supports. Anything else in the config is rejected at
/// parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Ban,
    Captcha,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Ban => f.write_str("ban"),
            Action::Captcha => f.write_str("captcha"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TurnstileSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rotate_secret_key: bool,
    #[serde(default = "default_rotation_interval")]
    pub rotate_secret_key_every: HumanDuration,
    #[serde(default)]
    pub mode: WidgetMode,
}

impl Default for TurnstileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rotate_secret_key: false,
            rotate_secret_key_every: default_rotation_interval(),
            mode: WidgetMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogMedia {
    #[default]
    Stdout,
    File,
}

/// Duration deserialized from human-friendly strings (`10s`, `2h`, …) and
/// serialized back in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HumanDuration(
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration_secs"
    )]
    pub Duration,
);

impl From<HumanDuration> for Duration {
    fn from(value: HumanDuration) -> Self {
        value.0
    }
}

fn serialize_duration_secs<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}s", duration.as_secs()))
}

fn default_update_frequency() -> HumanDuration {
    HumanDuration(Duration::from_secs(10))
}

fn default_rotation_interval() -> HumanDuration {
    HumanDuration(Duration::from_secs(24 * 60 * 60))
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/")
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    2112
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const FULL_CONFIG: &str = r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: stream-key
  update_frequency: 15s
  include_scenarios_containing: [http]
  only_include_decisions_from: [crowdsec]
cloudflare_config:
  accounts:
    - id: acc1
      token: tok1
      account_name: acme
      zones:
        - zone_id: z1
          actions: [ban, captcha]
          default_action: captcha
          routes_to_protect:
            - example.com/*
          turnstile:
            enabled: true
            rotate_secret_key: true
            rotate_secret_key_every: 12h
            mode: non-interactive
log_level: debug
log_media: stdout
prometheus:
  enabled: true
  listen_addr: 0.0.0.0
  listen_port: 9090
"#;

    #[test]
    fn full_document_parses() {
        let config = BouncerConfig::parse(FULL_CONFIG).unwrap();

        assert_eq!(
            Duration::from(config.crowdsec_config.update_frequency),
            Duration::from_secs(15)
        );
        let account = &config.cloudflare_config.accounts[0];
        assert_eq!(account.display_name(), "acme");
        let zone = &account.zones[0];
        assert_eq!(zone.default_action, Action::Captcha);
        assert_eq!(zone.turnstile.mode, WidgetMode::NonInteractive);
        assert_eq!(
            Duration::from(zone.turnstile.rotate_secret_key_every),
            Duration::from_secs(12 * 60 * 60)
        );
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.prometheus.enabled);
        assert_eq!(config.prometheus.listen_port, 9090);
    }

    #[test]
    fn defaults_are_applied() {
        let config = BouncerConfig::parse(
            r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: key
cloudflare_config:
  accounts:
    - id: acc1
      token: tok1
      zones:
        - zone_id: z1
          actions: [ban]
"#,
        )
        .unwrap();

        assert_eq!(
            Duration::from(config.crowdsec_config.update_frequency),
            Duration::from_secs(10)
        );
        let zone = &config.cloudflare_config.accounts[0].zones[0];
        assert_eq!(zone.default_action, Action::Ban);
        assert!(!zone.turnstile.enabled);
        assert!(!config.prometheus.enabled);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(
            config.cloudflare_config.accounts[0].display_name(),
            "acc1"
        );
    }

    #[test]
    fn unknown_action_is_rejected_at_parse_time() {
        let err = BouncerConfig::parse(
            r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: key
cloudflare_config:
  accounts:
    - id: acc1
      token: tok1
      zones:
        - zone_id: z1
          actions: [redirect]
"#,
        )
        .unwrap_err();
        assert_matches!(err, ConfigError::Parse(_));
    }

    #[test]
    fn default_action_must_be_in_the_action_set() {
        let err = BouncerConfig::parse(
            r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: key
cloudflare_config:
  accounts:
    - id: acc1
      token: tok1
      zones:
        - zone_id: z1
          actions: [ban]
          default_action: captcha
          turnstile:
            enabled: true
"#,
        )
        .unwrap_err();
        assert_matches!(
            err,
            ConfigError::DefaultActionNotSupported { zone, action: Action::Captcha } if zone == "z1"
        );
    }

    #[test]
    fn captcha_requires_turnstile() {
        let err = BouncerConfig::parse(
            r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: key
cloudflare_config:
  accounts:
    - id: acc1
      token: tok1
      zones:
        - zone_id: z1
          actions: [ban, captcha]
          default_action: ban
"#,
        )
        .unwrap_err();
        assert_matches!(err, ConfigError::CaptchaRequiresTurnstile { zone } if zone == "z1");
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let err = BouncerConfig::parse(
            r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: ""
cloudflare_config:
  accounts: []
"#,
        )
        .unwrap_err();
        assert_matches!(err, ConfigError::MissingLapiKey);

        let err = BouncerConfig::parse(
            r#"
crowdsec_config:
  lapi_url: http://localhost:8080/
  lapi_key: key
cloudflare_config:
  accounts:
    - id: acc1
      token: ""
      zones: []
"#,
        )
        .unwrap_err();
        assert_matches!(err, ConfigError::MissingToken { account } if account == "acc1");
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = BouncerConfig::parse(FULL_CONFIG).unwrap();
        let rendered = serde_yaml::to_string(&config).unwrap();
        let reparsed = BouncerConfig::parse(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }
}
