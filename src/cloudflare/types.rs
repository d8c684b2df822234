//! Wire types of the Cloudflare v4 REST surface used by the synchronizer.

use serde::{Deserialize, Serialize};

/// Standard response envelope shared by all v4 endpoints.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
    pub result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultInfo {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KvNamespace {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One page of a cursor-paginated key listing.
#[derive(Debug, Default, PartialEq)]
pub struct KeyListPage {
    pub keys: Vec<String>,
    /// Cursor for the next page. `None` on the last page.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerRoute {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub script: Option<String>,
}

/// Worker bindings shipped in the upload metadata.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerBinding {
    KvNamespace { name: String, namespace_id: String },
    PlainText { name: String, text: String },
    D1 { name: String, id: String },
}

/// Credentials of a Turnstile widget. The site key never changes for the
/// lifetime of the widget; the secret is rotatable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WidgetTokens {
    pub site_key: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnstileWidget {
    pub sitekey: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetMode {
    #[default]
    Managed,
    Invisible,
    NonInteractive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsDb {
    pub uuid: String,
    pub name: String,
}

/// One statement result of a D1 query. Rows come back as loose JSON objects;
/// callers deserialize them into whatever shape they expect.
#[derive(Debug, Default, Deserialize)]
pub struct D1QueryResult {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_binding_serialization() {
        let bindings = vec![
            WorkerBinding::KvNamespace {
                name: "KV_NAMESPACE".into(),
                namespace_id: "abc".into(),
            },
            WorkerBinding::PlainText {
                name: "ACTIONS_BY_DOMAIN".into(),
                text: "{}".into(),
            },
            WorkerBinding::D1 {
                name: "METRICS_DB".into(),
                id: "db1".into(),
            },
        ];
        let json = serde_json::to_value(&bindings).unwrap();
        assert_eq!(json[0]["type"], "kv_namespace");
        assert_eq!(json[1]["type"], "plain_text");
        assert_eq!(json[2]["type"], "d1");
    }

    #[test]
    fn widget_mode_wire_values() {
        assert_eq!(
            serde_json::to_string(&WidgetMode::NonInteractive).unwrap(),
            "\"non-interactive\""
        );
        assert_eq!(
            serde_json::to_string(&WidgetMode::Managed).unwrap(),
            "\"managed\""
        );
    }
}
