//! Per-account reconciliation between the in-memory decision index and the
//! remote KV namespace.
//!
//! Each reconciler exclusively owns one account's [DecisionIndex]. A cycle
//! applies deletions before additions so same-value churn lands on the
//! addition, then commits the aggregated range document when its canonical
//! serialization changed. Bulk calls are staged, deduped and split into
//! API-sized sub-batches that run concurrently; the index is only mutated
//! after every sub-batch of an operation succeeded.

pub mod index;

use crate::cloudflare::CloudflareApi;
use crate::cloudflare::error::ApiError;
use crate::cloudflare::types::KvPair;
use crate::crowdsec::decision::{Decision, Scope};
use crate::crowdsec::stream::DecisionSet;
use crate::defaults::{
    BULK_WRITE_LIMIT, KEY_IP_RANGES, KEY_RESET, KEY_WARMED_UP, PRESERVED_KEYS,
};
use crate::metrics::{AccountLabels, DecisionLabels, Metrics};
use index::DecisionIndex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub struct AccountReconciler<C> {
    api: Arc<C>,
    account_name: String,
    namespace_id: String,
    index: DecisionIndex,
    /// Serialization of the range map as last committed to `IP_RANGES`.
    last_ranges: String,
    warmed_up: bool,
    metrics: Arc<Metrics>,
    /// Label sets reported last cycle, so series of decisions that expired
    /// can be zeroed instead of lingering at their old value.
    reported_labels: HashSet<DecisionLabels>,
}

impl<C: CloudflareApi> AccountReconciler<C> {
    pub fn new(
        api: Arc<C>,
        account_name: impl Into<String>,
        namespace_id: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            account_name: account_name.into(),
            namespace_id: namespace_id.into(),
            index: DecisionIndex::default(),
            last_ranges: DecisionIndex::empty_ranges_doc(),
            warmed_up: false,
            metrics,
            reported_labels: HashSet::new(),
        }
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    /// Whether the namespace already ingested a full snapshot. Once true this
    /// never reverts for the lifetime of the process, even across resets.
    pub fn warmed_up(&self) -> bool {
        self.warmed_up
    }

    /// Checks the remote warmup sentinel. Absence means the namespace is
    /// empty and the next stream fetch must request the full snapshot.
    pub fn probe_warmed_up(&mut self) -> Result<bool, ApiError> {
        let values = self
            .api
            .read_keys(&self.namespace_id, &[KEY_WARMED_UP.to_string()])?;
        self.warmed_up = values.contains_key(KEY_WARMED_UP);
        Ok(self.warmed_up)
    }

    /// Applies one stream cycle. An empty batch is a complete no-op.
    pub fn reconcile(&mut self, batch: &DecisionSet) -> Result<(), ApiError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.honor_reset_flag()?;
        self.apply_deletions(&batch.deleted)?;
        self.apply_additions(&batch.new)?;
        self.commit_ranges_if_changed()?;
        if !self.warmed_up {
            self.mark_warmed_up()?;
        }
        self.update_totals();
        Ok(())
    }

    /// Reset requested by upstream (204): purge every decision key while
    /// preserving the templates, then report totals again.
    pub fn reset(&mut self) -> Result<(), ApiError> {
        info!(account = %self.account_name, "upstream holds no decisions, purging namespace");
        self.purge_decision_keys()?;
        self.update_totals();
        Ok(())
    }

    /// Honors the operator-writable `RESET` sentinel.
    fn honor_reset_flag(&mut self) -> Result<(), ApiError> {
        let values = self
            .api
            .read_keys(&self.namespace_id, &[KEY_RESET.to_string()])?;
        if values.get(KEY_RESET).map(String::as_str) == Some("true") {
            info!(account = %self.account_name, "RESET sentinel set, purging namespace");
            self.purge_decision_keys()?;
        }
        Ok(())
    }

    /// Removes decisions whose deletion matches the currently indexed
    /// remediation. Deletions carrying a stale remediation refer to a
    /// decision already superseded and are skipped.
    pub fn apply_deletions(&mut self, decisions: &[Decision]) -> Result<(), ApiError> {
        // Staged removals are keyed by the decision value: two deletions with
        // colliding remediations must still stage two distinct keys.
        let mut staged: HashMap<String, String> = HashMap::new();
        for decision in decisions {
            match decision.scope {
                Scope::Range => {
                    if self.index.range_remediation(&decision.value)
                        == Some(decision.remediation.as_str())
                    {
                        self.index.remove_range(&decision.value);
                    }
                }
                _ => {
                    if self.index.string_remediation(&decision.value)
                        == Some(decision.remediation.as_str())
                    {
                        staged.insert(decision.value.clone(), decision.remediation.clone());
                    } else {
                        debug!(
                            account = %self.account_name,
                            value = %decision.value,
                            "skipping deletion of superseded decision"
                        );
                    }
                }
            }
        }
        if staged.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = staged.keys().cloned().collect();
        keys.sort();
        self.bulk_delete(&keys)?;
        for key in &keys {
            self.index.remove_string(key);
        }
        Ok(())
    }

    /// Upserts decisions into the index, writing individual KV entries for
    /// string scopes. Range decisions only touch the in-memory range map; the
    /// aggregated document is committed separately.
    pub fn apply_additions(&mut self, decisions: &[Decision]) -> Result<(), ApiError> {
        // Last write wins per value within one batch.
        let mut staged: HashMap<String, Decision> = HashMap::new();
        for decision in decisions {
            match decision.scope {
                Scope::Range => self.index.insert(decision),
                _ => {
                    if self.index.string_remediation(&decision.value)
                        != Some(decision.remediation.as_str())
                    {
                        staged.insert(decision.value.clone(), decision.clone());
                    }
                }
            }
        }
        if staged.is_empty() {
            return Ok(());
        }

        let mut pairs: Vec<KvPair> = staged
            .values()
            .map(|d| KvPair::new(d.value.clone(), d.remediation.clone()))
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        self.bulk_write(&pairs)?;
        for decision in staged.values() {
            self.index.insert(decision);
        }
        Ok(())
    }

    /// Re-serializes the range map and writes `IP_RANGES` only when the
    /// canonical document differs from the last committed one.
    pub fn commit_ranges_if_changed(&mut self) -> Result<(), ApiError> {
        let doc = self.index.serialize_ranges();
        if doc == self.last_ranges {
            return Ok(());
        }
        self.api.write_key_value_pairs(
            &self.namespace_id,
            &[KvPair::new(KEY_IP_RANGES, doc.clone())],
        )?;
        self.last_ranges = doc;
        Ok(())
    }

    /// Recomputes the derived gauges after a cycle.
    pub fn update_totals(&mut self) {
        self.metrics
            .keys_total
            .get_or_create(&AccountLabels {
                account: self.account_name.clone(),
            })
            .set(self.index.key_count() as i64);

        let mut counts: HashMap<DecisionLabels, i64> = HashMap::new();
        for entry in self.index.entries() {
            let labels = DecisionLabels {
                origin: entry.origin.clone(),
                ip_type: entry.ip_type.to_string(),
                scope: entry.scope.as_str().to_string(),
                account: self.account_name.clone(),
                remediation: entry.remediation.clone(),
            };
            *counts.entry(labels).or_default() += 1;
        }
        for stale in self.reported_labels.iter() {
            if !counts.contains_key(stale) {
                self.metrics.active_decisions.get_or_create(stale).set(0);
            }
        }
        self.reported_labels = counts.keys().cloned().collect();
        for (labels, count) in counts {
            self.metrics.active_decisions.get_or_create(&labels).set(count);
        }
    }

    fn mark_warmed_up(&mut self) -> Result<(), ApiError> {
        self.api.write_key_value_pairs(
            &self.namespace_id,
            &[KvPair::new(KEY_WARMED_UP, "true")],
        )?;
        self.warmed_up = true;
        Ok(())
    }

    /// Deletes every non-preserved key in the namespace and arms `RESET`
    /// back to `"false"`. The in-memory index starts over.
    fn purge_decision_keys(&mut self) -> Result<(), ApiError> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.api.list_keys(&self.namespace_id, cursor.as_deref())?;
            keys.extend(page.keys);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        keys.retain(|key| !PRESERVED_KEYS.contains(&key.as_str()));
        keys.sort();
        self.bulk_delete(&keys)?;
        self.api.write_key_value_pairs(
            &self.namespace_id,
            &[KvPair::new(KEY_RESET, "false")],
        )?;
        self.index.clear();
        self.last_ranges = DecisionIndex::empty_ranges_doc();
        Ok(())
    }

    /// Issues one bulk write per API-sized chunk, concurrently. Fails if any
    /// chunk fails.
    fn bulk_write(&self, pairs: &[KvPair]) -> Result<(), ApiError> {
        if pairs.is_empty() {
            return Ok(());
        }
        thread::scope(|scope| {
            let handles: Vec<_> = pairs
                .chunks(BULK_WRITE_LIMIT)
                .map(|chunk| {
                    scope.spawn(move || self.api.write_key_value_pairs(&self.namespace_id, chunk))
                })
                .collect();
            handles
                .into_iter()
                .try_for_each(|handle| handle.join().expect("bulk write thread panicked"))
        })
    }

    /// Issues one bulk delete per API-sized chunk, concurrently. Fails if
    /// any chunk fails.
    fn bulk_delete(&self, keys: &[String]) -> Result<(), ApiError> {
        if keys.is_empty() {
            return Ok(());
        }
        thread::scope(|scope| {
            let handles: Vec<_> = keys
                .chunks(BULK_WRITE_LIMIT)
                .map(|chunk| scope.spawn(move || self.api.delete_keys(&self.namespace_id, chunk)))
                .collect();
            handles
                .into_iter()
                .try_for_each(|handle| handle.join().expect("bulk delete thread panicked"))
        })
    }
}

/// Logged when a cycle fails: the in-memory cache may have drifted from the
/// remote namespace and only a restart re-converges them.
pub fn log_cycle_failure(account: &str, err: &ApiError) {
    warn!(
        account,
        error_msg = %err,
        "reconciliation cycle failed, the local cache is likely out of sync; a restart is advised"
    );
}
