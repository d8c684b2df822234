//! In-memory decision index owned by one account reconciler.

use crate::crowdsec::decision::{Decision, Scope};
use std::collections::{BTreeMap, HashMap};

/// What the index remembers about one active decision. The origin is already
/// promoted to its metric label form.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub scope: Scope,
    pub remediation: String,
    pub origin: String,
    pub ip_type: &'static str,
}

impl From<&Decision> for IndexEntry {
    fn from(decision: &Decision) -> Self {
        Self {
            scope: decision.scope,
            remediation: decision.remediation.clone(),
            origin: decision.origin_label(),
            ip_type: decision.ip_type(),
        }
    }
}

/// Per-account view of the active decisions. `strings` backs the individual
/// KV entries (ip, as and country scopes), `ranges` backs the aggregated
/// `IP_RANGES` document. Each value maps to exactly one remediation at a
/// time.
#[derive(Debug, Default)]
pub struct DecisionIndex {
    strings: HashMap<String, IndexEntry>,
    ranges: HashMap<String, IndexEntry>,
}

impl DecisionIndex {
    pub fn string_remediation(&self, value: &str) -> Option<&str> {
        self.strings.get(value).map(|e| e.remediation.as_str())
    }

    pub fn range_remediation(&self, value: &str) -> Option<&str> {
        self.ranges.get(value).map(|e| e.remediation.as_str())
    }

    pub fn insert(&mut self, decision: &Decision) {
        let entry = IndexEntry::from(decision);
        match decision.scope {
            Scope::Range => self.ranges.insert(decision.value.clone(), entry),
            _ => self.strings.insert(decision.value.clone(), entry),
        };
    }

    pub fn remove_string(&mut self, value: &str) {
        self.strings.remove(value);
    }

    pub fn remove_range(&mut self, value: &str) {
        self.ranges.remove(value);
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.ranges.clear();
    }

    /// Number of KV keys this index projects: one per string-scoped decision
    /// plus the `IP_RANGES` document when any range is active.
    pub fn key_count(&self) -> usize {
        self.strings.len() + usize::from(!self.ranges.is_empty())
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.strings.values().chain(self.ranges.values())
    }

    /// Canonical serialization of the range map. Keys are emitted in sorted
    /// order so equal maps always serialize to the same string, which is what
    /// the change detection compares.
    pub fn serialize_ranges(&self) -> String {
        let sorted: BTreeMap<&str, &str> = self
            .ranges
            .iter()
            .map(|(cidr, entry)| (cidr.as_str(), entry.remediation.as_str()))
            .collect();
        serde_json::to_string(&sorted).expect("string map serialization cannot fail")
    }

    /// Serialization of an index with no active ranges.
    pub fn empty_ranges_doc() -> String {
        "{}".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(scope: Scope, remediation: &str, value: &str) -> Decision {
        Decision {
            scope,
            remediation: remediation.into(),
            value: value.into(),
            origin: "crowdsec".into(),
            scenario: "test".into(),
            duration: "4h".into(),
        }
    }

    #[test]
    fn ranges_serialize_deterministically() {
        let mut a = DecisionIndex::default();
        let mut b = DecisionIndex::default();
        for d in [
            decision(Scope::Range, "ban", "10.0.0.0/8"),
            decision(Scope::Range, "captcha", "192.168.0.0/16"),
        ] {
            a.insert(&d);
        }
        for d in [
            decision(Scope::Range, "captcha", "192.168.0.0/16"),
            decision(Scope::Range, "ban", "10.0.0.0/8"),
        ] {
            b.insert(&d);
        }

        assert_eq!(a.serialize_ranges(), b.serialize_ranges());
        assert_eq!(
            a.serialize_ranges(),
            r#"{"10.0.0.0/8":"ban","192.168.0.0/16":"captcha"}"#
        );
    }

    #[test]
    fn value_change_at_a_single_key_changes_the_serialization() {
        let mut old = DecisionIndex::default();
        let mut new = DecisionIndex::default();
        for index in [&mut old, &mut new] {
            index.insert(&decision(Scope::Range, "ban", "10.0.0.0/8"));
            index.insert(&decision(Scope::Range, "ban", "172.16.0.0/12"));
        }
        // identical key sets, one value differs
        new.insert(&decision(Scope::Range, "captcha", "172.16.0.0/12"));

        assert_ne!(old.serialize_ranges(), new.serialize_ranges());
    }

    #[test]
    fn key_count_includes_the_ranges_document() {
        let mut index = DecisionIndex::default();
        assert_eq!(index.key_count(), 0);

        index.insert(&decision(Scope::Ip, "ban", "1.2.3.4"));
        index.insert(&decision(Scope::As, "ban", "64500"));
        assert_eq!(index.key_count(), 2);

        index.insert(&decision(Scope::Range, "ban", "10.0.0.0/8"));
        assert_eq!(index.key_count(), 3);

        index.remove_range("10.0.0.0/8");
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn each_value_maps_to_exactly_one_remediation() {
        let mut index = DecisionIndex::default();
        index.insert(&decision(Scope::Ip, "ban", "1.2.3.4"));
        index.insert(&decision(Scope::Ip, "captcha", "1.2.3.4"));
        assert_eq!(index.string_remediation("1.2.3.4"), Some("captcha"));
    }
}
