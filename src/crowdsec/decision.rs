//! Decision model and normalizer.
//!
//! LAPI emits loosely-typed decision objects. [normalize] lower-cases the
//! identifying fields, drops decisions targeting unsupported scopes and
//! rejects structurally incomplete ones, preserving the relative order of the
//! input.

use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

/// Identifier family a decision targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Ip,
    Range,
    As,
    Country,
}

impl Scope {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ip" => Some(Scope::Ip),
            "range" => Some(Scope::Range),
            "as" => Some(Scope::As),
            "country" => Some(Scope::Country),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Range => "range",
            Scope::As => "as",
            Scope::Country => "country",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision as it arrives from the stream. All fields are optional so a
/// single malformed element cannot fail the whole batch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDecision {
    pub origin: Option<String>,
    #[serde(rename = "type")]
    pub remediation: Option<String>,
    pub scope: Option<String>,
    pub value: Option<String>,
    pub duration: Option<String>,
    pub scenario: Option<String>,
    pub until: Option<String>,
}

/// A normalized decision. Never mutated after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub scope: Scope,
    /// Remediation to apply. Kept as free text: the enforcement worker falls
    /// back to the zone default for remediations it does not support.
    pub remediation: String,
    pub value: String,
    pub origin: String,
    pub scenario: String,
    pub duration: String,
}

impl Decision {
    /// Origin as used for metric labels. Decisions imported from blocklists
    /// all share the `lists` origin, so the scenario is appended to keep them
    /// distinguishable.
    pub fn origin_label(&self) -> String {
        if self.origin == "lists" {
            format!("lists:{}", self.scenario)
        } else {
            self.origin.clone()
        }
    }

    /// Address family label. Empty for scopes without one.
    pub fn ip_type(&self) -> &'static str {
        match self.scope {
            Scope::Ip | Scope::Range => {
                if self.value.contains(':') {
                    "ipv6"
                } else {
                    "ipv4"
                }
            }
            Scope::As | Scope::Country => "",
        }
    }
}

/// Normalizes a batch lazily, keeping the input order of surviving elements.
pub fn normalize(decisions: Vec<RawDecision>) -> impl Iterator<Item = Decision> {
    decisions.into_iter().filter_map(to_decision)
}

fn to_decision(raw: RawDecision) -> Option<Decision> {
    let (Some(origin), Some(remediation), Some(scope), Some(value), Some(duration), Some(scenario)) = (
        raw.origin,
        raw.remediation,
        raw.scope,
        raw.value,
        raw.duration,
        raw.scenario,
    ) else {
        warn!("dropping structurally incomplete decision");
        return None;
    };

    let scope_lower = scope.to_lowercase();
    let Some(scope) = Scope::parse(&scope_lower) else {
        debug!(scope = %scope_lower, "dropping decision with unsupported scope");
        return None;
    };

    Some(Decision {
        scope,
        remediation: remediation.to_lowercase(),
        value: value.to_lowercase(),
        origin: origin.to_lowercase(),
        scenario: scenario.to_lowercase(),
        duration,
    })
}
