//! Turnstile widget lifecycle and secret rotation.
//!
//! One widget is created per Turnstile-enabled zone. The `{domain →
//! {site_key, secret}}` map is mirrored under `TURNSTILE_CONFIG` so the
//! enforcement worker can render challenges. Rotation runs on one thread per
//! zone; the shared token map is guarded by a mutex because rotation ticks
//! and republishing both touch it.

use crate::cloudflare::CloudflareApi;
use crate::cloudflare::error::ApiError;
use crate::cloudflare::types::{KvPair, WidgetMode, WidgetTokens};
use crate::defaults::{KEY_TURNSTILE_CONFIG, WIDGET_NAME};
use crate::utils::background::BackgroundJob;
use crossbeam::channel::tick;
use crossbeam::select;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum TurnstileError {
    #[error("cloudflare api: {0}")]
    Api(#[from] ApiError),

    #[error("no widget is tracked for domain `{0}`")]
    UnknownDomain(String),
}

/// Turnstile-relevant view of one zone, resolved to its apex domain.
#[derive(Debug, Clone)]
pub struct TurnstileZone {
    pub domain: String,
    pub mode: WidgetMode,
    pub rotate_secret: bool,
    pub rotation_interval: Duration,
}

pub struct TurnstileManager<C> {
    api: Arc<C>,
    namespace_id: String,
    account_name: String,
    tokens: Mutex<HashMap<String, WidgetTokens>>,
}

impl<C: CloudflareApi> TurnstileManager<C> {
    pub fn new(
        api: Arc<C>,
        account_name: impl Into<String>,
        namespace_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            namespace_id: namespace_id.into(),
            account_name: account_name.into(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Creates one widget per zone and publishes the collected tokens.
    pub fn bootstrap(&self, zones: &[TurnstileZone]) -> Result<(), TurnstileError> {
        for zone in zones {
            let tokens = self.api.create_turnstile_widget(
                WIDGET_NAME,
                std::slice::from_ref(&zone.domain),
                zone.mode,
            )?;
            info!(
                account = %self.account_name,
                domain = %zone.domain,
                site_key = %tokens.site_key,
                "created turnstile widget"
            );
            self.lock_tokens().insert(zone.domain.clone(), tokens);
        }
        self.publish()
    }

    /// Rotates one zone's widget secret. The site key is immutable across
    /// rotations; only the secret changes.
    pub fn rotate(&self, domain: &str) -> Result<(), TurnstileError> {
        {
            let mut tokens = self.lock_tokens();
            let entry = tokens
                .get_mut(domain)
                .ok_or_else(|| TurnstileError::UnknownDomain(domain.to_string()))?;
            entry.secret = self.api.rotate_turnstile_secret(&entry.site_key, true)?;
        }
        info!(account = %self.account_name, domain, "rotated turnstile secret");
        self.publish()
    }

    /// Serializes the token map under `TURNSTILE_CONFIG`. Domains are emitted
    /// in sorted order.
    fn publish(&self) -> Result<(), TurnstileError> {
        let document = {
            let tokens = self.lock_tokens();
            let sorted: BTreeMap<&String, &WidgetTokens> = tokens.iter().collect();
            serde_json::to_string(&sorted).expect("string map serialization cannot fail")
        };
        self.api.write_key_value_pairs(
            &self.namespace_id,
            &[KvPair::new(KEY_TURNSTILE_CONFIG, document)],
        )?;
        Ok(())
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, WidgetTokens>> {
        self.tokens.lock().expect("turnstile token map lock poisoned")
    }

    #[cfg(test)]
    fn tokens_for(&self, domain: &str) -> Option<WidgetTokens> {
        self.lock_tokens().get(domain).cloned()
    }
}

impl<C: CloudflareApi + 'static> TurnstileManager<C> {
    /// Spawns one rotation thread per zone with rotation enabled. Each tick
    /// rotates the secret and republishes the config document; cancellation
    /// stops the loop promptly.
    pub fn start_rotators(self: &Arc<Self>, zones: &[TurnstileZone]) -> Vec<BackgroundJob> {
        zones
            .iter()
            .filter(|zone| zone.rotate_secret)
            .map(|zone| {
                let manager = Arc::clone(self);
                let domain = zone.domain.clone();
                let ticker = tick(zone.rotation_interval);
                BackgroundJob::spawn(format!("turnstile-rotator-{}", zone.domain), move |stop| {
                    loop {
                        select! {
                            recv(ticker) -> _ => {
                                if let Err(err) = manager.rotate(&domain) {
                                    error!(domain = %domain, error_msg = %err, "secret rotation failed");
                                }
                            }
                            recv(stop.receiver()) -> _ => break,
                        }
                    }
                })
            })
            .collect()
    }
}
