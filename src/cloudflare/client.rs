//! Blocking REST implementation of [CloudflareApi].
//!
//! Every request carries the account token as a bearer credential and bumps
//! the per-account API call counter, regardless of outcome. The client never
//! retries; errors are classified into [ApiError] and surfaced to the caller.

use super::CloudflareApi;
use super::error::ApiError;
use super::types::{
    Account, D1QueryResult, Envelope, KeyListPage, KvNamespace, KvPair, MetricsDb,
    TurnstileWidget, WidgetMode, WidgetTokens, WorkerBinding, WorkerRoute, Zone,
};
use crate::defaults::{BULK_READ_LIMIT, BULK_WRITE_LIMIT};
use crate::metrics::Metrics;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

pub struct CloudflareClient {
    http: Client,
    base_url: String,
    token: String,
    account_id: String,
    account_name: String,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
struct KeyName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BulkGetValues {
    #[serde(default)]
    values: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RotatedSecret {
    secret: String,
}

impl CloudflareClient {
    pub fn new(
        http: Client,
        token: impl Into<String>,
        account_id: impl Into<String>,
        account_name: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            account_id: account_id.into(),
            account_name: account_name.into(),
            metrics,
        }
    }

    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..self
        }
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends a prepared request and decodes the v4 envelope. The API call
    /// counter is incremented before the request goes out so failed calls are
    /// counted too.
    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Envelope<T>, ApiError> {
        self.metrics.inc_api_calls(&self.account_name);

        let response = request
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, body));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body)
            .map_err(|err| ApiError::Malformed(format!("undecodable response: {err}")))?;
        if !envelope.success {
            let messages: Vec<String> = envelope
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect();
            return Err(ApiError::Malformed(messages.join("; ")));
        }
        Ok(envelope)
    }

    fn result_of<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        self.send::<T>(request)?
            .result
            .ok_or_else(|| ApiError::Malformed("response carried no result".to_string()))
    }

    fn discard_result(&self, request: RequestBuilder) -> Result<(), ApiError> {
        self.send::<serde_json::Value>(request).map(|_| ())
    }
}

impl CloudflareApi for CloudflareClient {
    fn list_accounts(&self) -> Result<Vec<Account>, ApiError> {
        self.result_of(self.http.get(self.url("/accounts")))
    }

    fn list_zones(&self) -> Result<Vec<Zone>, ApiError> {
        let url = self.url("/zones");
        self.result_of(
            self.http
                .get(url)
                .query(&[("account.id", self.account_id.as_str()), ("per_page", "50")]),
        )
    }

    fn list_kv_namespaces(&self) -> Result<Vec<KvNamespace>, ApiError> {
        let path = format!("/accounts/{}/storage/kv/namespaces", self.account_id);
        self.result_of(self.http.get(self.url(&path)).query(&[("per_page", "100")]))
    }

    fn create_kv_namespace(&self, title: &str) -> Result<KvNamespace, ApiError> {
        let path = format!("/accounts/{}/storage/kv/namespaces", self.account_id);
        self.result_of(self.http.post(self.url(&path)).json(&json!({ "title": title })))
    }

    fn delete_kv_namespace(&self, namespace_id: &str) -> Result<(), ApiError> {
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{namespace_id}",
            self.account_id
        );
        self.discard_result(self.http.delete(self.url(&path)))
    }

    fn write_key_value_pairs(&self, namespace_id: &str, pairs: &[KvPair]) -> Result<(), ApiError> {
        if pairs.len() > BULK_WRITE_LIMIT {
            return Err(ApiError::Malformed(format!(
                "bulk write of {} entries exceeds the {BULK_WRITE_LIMIT} entry limit",
                pairs.len()
            )));
        }
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{namespace_id}/bulk",
            self.account_id
        );
        self.discard_result(self.http.put(self.url(&path)).json(&pairs))
    }

    fn delete_keys(&self, namespace_id: &str, keys: &[String]) -> Result<(), ApiError> {
        if keys.len() > BULK_WRITE_LIMIT {
            return Err(ApiError::Malformed(format!(
                "bulk delete of {} keys exceeds the {BULK_WRITE_LIMIT} key limit",
                keys.len()
            )));
        }
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{namespace_id}/bulk",
            self.account_id
        );
        self.discard_result(self.http.delete(self.url(&path)).json(&keys))
    }

    fn read_keys(
        &self,
        namespace_id: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, ApiError> {
        if keys.len() > BULK_READ_LIMIT {
            return Err(ApiError::Malformed(format!(
                "bulk read of {} keys exceeds the {BULK_READ_LIMIT} key limit",
                keys.len()
            )));
        }
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{namespace_id}/bulk/get",
            self.account_id
        );
        let values: BulkGetValues =
            self.result_of(self.http.post(self.url(&path)).json(&json!({ "keys": keys })))?;
        Ok(values
            .values
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }

    fn list_keys(
        &self,
        namespace_id: &str,
        cursor: Option<&str>,
    ) -> Result<KeyListPage, ApiError> {
        let path = format!(
            "/accounts/{}/storage/kv/namespaces/{namespace_id}/keys",
            self.account_id
        );
        let mut request = self.http.get(self.url(&path));
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let envelope = self.send::<Vec<KeyName>>(request)?;
        let keys = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.name)
            .collect();
        let cursor = envelope
            .result_info
            .and_then(|info| info.cursor)
            .filter(|c| !c.is_empty());
        Ok(KeyListPage { keys, cursor })
    }

    fn upload_worker(
        &self,
        script_name: &str,
        script: &str,
        bindings: &[WorkerBinding],
    ) -> Result<(), ApiError> {
        let path = format!("/accounts/{}/workers/scripts/{script_name}", self.account_id);
        let metadata = json!({
            "main_module": "worker.js",
            "bindings": bindings,
        });
        let form = Form::new()
            .part(
                "metadata",
                Part::text(metadata.to_string())
                    .mime_str("application/json")
                    .map_err(|err| ApiError::Malformed(err.to_string()))?,
            )
            .part(
                "worker.js",
                Part::text(script.to_string())
                    .file_name("worker.js")
                    .mime_str("application/javascript+module")
                    .map_err(|err| ApiError::Malformed(err.to_string()))?,
            );
        self.discard_result(self.http.put(self.url(&path)).multipart(form))
    }

    fn delete_worker(&self, script_name: &str) -> Result<(), ApiError> {
        let path = format!("/accounts/{}/workers/scripts/{script_name}", self.account_id);
        self.discard_result(self.http.delete(self.url(&path)))
    }

    fn list_worker_routes(&self, zone_id: &str) -> Result<Vec<WorkerRoute>, ApiError> {
        let path = format!("/zones/{zone_id}/workers/routes");
        self.result_of(self.http.get(self.url(&path)))
    }

    fn create_worker_route(
        &self,
        zone_id: &str,
        pattern: &str,
        script_name: &str,
        fail_open: bool,
    ) -> Result<String, ApiError> {
        let path = format!("/zones/{zone_id}/workers/routes");
        let route: WorkerRoute = self.result_of(self.http.post(self.url(&path)).json(&json!({
            "pattern": pattern,
            "script": script_name,
            "request_limit_fail_open": fail_open,
        })))?;
        Ok(route.id)
    }

    fn delete_worker_route(&self, zone_id: &str, route_id: &str) -> Result<(), ApiError> {
        let path = format!("/zones/{zone_id}/workers/routes/{route_id}");
        self.discard_result(self.http.delete(self.url(&path)))
    }

    fn create_turnstile_widget(
        &self,
        name: &str,
        domains: &[String],
        mode: WidgetMode,
    ) -> Result<WidgetTokens, ApiError> {
        let path = format!("/accounts/{}/challenges/widgets", self.account_id);
        let widget: TurnstileWidget =
            self.result_of(self.http.post(self.url(&path)).json(&json!({
                "name": name,
                "domains": domains,
                "mode": mode,
            })))?;
        let secret = widget.secret.ok_or_else(|| {
            ApiError::Malformed("widget creation response carried no secret".to_string())
        })?;
        Ok(WidgetTokens {
            site_key: widget.sitekey,
            secret,
        })
    }

    fn list_turnstile_widgets(&self) -> Result<Vec<TurnstileWidget>, ApiError> {
        let path = format!("/accounts/{}/challenges/widgets", self.account_id);
        self.result_of(self.http.get(self.url(&path)))
    }

    fn rotate_turnstile_secret(
        &self,
        site_key: &str,
        invalidate_immediately: bool,
    ) -> Result<String, ApiError> {
        let path = format!(
            "/accounts/{}/challenges/widgets/{site_key}/rotate_secret",
            self.account_id
        );
        let rotated: RotatedSecret = self.result_of(
            self.http
                .post(self.url(&path))
                .json(&json!({ "invalidate_immediately": invalidate_immediately })),
        )?;
        Ok(rotated.secret)
    }

    fn delete_turnstile_widget(&self, site_key: &str) -> Result<(), ApiError> {
        let path = format!("/accounts/{}/challenges/widgets/{site_key}", self.account_id);
        self.discard_result(self.http.delete(self.url(&path)))
    }

    fn create_metrics_db(&self, name: &str) -> Result<String, ApiError> {
        let path = format!("/accounts/{}/d1/database", self.account_id);
        let db: MetricsDb =
            self.result_of(self.http.post(self.url(&path)).json(&json!({ "name": name })))?;
        Ok(db.uuid)
    }

    fn list_metrics_dbs(&self) -> Result<Vec<MetricsDb>, ApiError> {
        let path = format!("/accounts/{}/d1/database", self.account_id);
        self.result_of(self.http.get(self.url(&path)))
    }

    fn query_metrics_db(
        &self,
        database_id: &str,
        sql: &str,
        params: &[String],
    ) -> Result<D1QueryResult, ApiError> {
        let path = format!("/accounts/{}/d1/database/{database_id}/query", self.account_id);
        let mut results: Vec<D1QueryResult> =
            self.result_of(self.http.post(self.url(&path)).json(&json!({
                "sql": sql,
                "params": params,
            })))?;
        let result = results.drain(..).next().unwrap_or_default();
        Ok(result)
    }

    fn delete_metrics_db(&self, database_id: &str) -> Result<(), ApiError> {
        let path = format!("/accounts/{}/d1/database/{database_id}", self.account_id);
        self.discard_result(self.http.delete(self.url(&path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use httpmock::Method::{DELETE, GET, POST, PUT};
    use httpmock::MockServer;

    fn client_for(server: &MockServer) -> CloudflareClient {
        CloudflareClient::new(
            Client::new(),
            "test-token",
            "acc1",
            "acme",
            Arc::new(Metrics::default()),
        )
        .with_base_url(server.base_url())
    }

    #[test]
    fn bulk_write_hits_the_bulk_endpoint_with_bearer_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PUT)
                .path("/accounts/acc1/storage/kv/namespaces/ns1/bulk")
                .header("authorization", "Bearer test-token")
                .json_body(serde_json::json!([
                    {"key": "1.2.3.4", "value": "ban"}
                ]));
            then.status(200)
                .json_body(serde_json::json!({"success": true, "result": null}));
        });

        let client = client_for(&server);
        client
            .write_key_value_pairs("ns1", &[KvPair::new("1.2.3.4", "ban")])
            .unwrap();
        mock.assert();
    }

    #[test]
    fn bulk_delete_sends_a_plain_key_array() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(DELETE)
                .path("/accounts/acc1/storage/kv/namespaces/ns1/bulk")
                .json_body(serde_json::json!(["1.2.3.4", "64500"]));
            then.status(200)
                .json_body(serde_json::json!({"success": true, "result": null}));
        });

        let client = client_for(&server);
        client
            .delete_keys("ns1", &["1.2.3.4".to_string(), "64500".to_string()])
            .unwrap();
        mock.assert();
    }

    #[test]
    fn oversized_bulk_inputs_are_rejected_locally() {
        let server = MockServer::start();
        let client = client_for(&server);

        let pairs: Vec<KvPair> = (0..=BULK_WRITE_LIMIT)
            .map(|i| KvPair::new(i.to_string(), "ban"))
            .collect();
        assert_matches!(
            client.write_key_value_pairs("ns1", &pairs),
            Err(ApiError::Malformed(_))
        );

        let keys: Vec<String> = (0..=BULK_READ_LIMIT).map(|i| i.to_string()).collect();
        assert_matches!(client.read_keys("ns1", &keys), Err(ApiError::Malformed(_)));
    }

    #[test]
    fn read_keys_returns_the_partial_map() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/accounts/acc1/storage/kv/namespaces/ns1/bulk/get")
                .json_body(serde_json::json!({"keys": ["1.2.3.4", "absent"]}));
            then.status(200).json_body(serde_json::json!({
                "success": true,
                "result": {"values": {"1.2.3.4": "ban"}}
            }));
        });

        let client = client_for(&server);
        let values = client
            .read_keys("ns1", &["1.2.3.4".to_string(), "absent".to_string()])
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("1.2.3.4").map(String::as_str), Some("ban"));
    }

    #[test]
    fn list_keys_surfaces_the_cursor_until_it_is_empty() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/accounts/acc1/storage/kv/namespaces/ns1/keys")
                .query_param_exists("cursor");
            then.status(200).json_body(serde_json::json!({
                "success": true,
                "result": [{"name": "b"}],
                "result_info": {"cursor": ""}
            }));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/accounts/acc1/storage/kv/namespaces/ns1/keys");
            then.status(200).json_body(serde_json::json!({
                "success": true,
                "result": [{"name": "a"}],
                "result_info": {"cursor": "next-page"}
            }));
        });

        let client = client_for(&server);
        let first = client.list_keys("ns1", None).unwrap();
        assert_eq!(first.keys, vec!["a".to_string()]);
        assert_eq!(first.cursor.as_deref(), Some("next-page"));

        let second = client.list_keys("ns1", first.cursor.as_deref()).unwrap();
        assert_eq!(second.keys, vec!["b".to_string()]);
        assert_eq!(second.cursor, None);
    }

    #[test]
    fn create_worker_route_carries_the_fail_open_flag() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/zones/z1/workers/routes").json_body(
                serde_json::json!({
                    "pattern": "example.com/*",
                    "script": "my-worker",
                    "request_limit_fail_open": true,
                }),
            );
            then.status(200).json_body(serde_json::json!({
                "success": true,
                "result": {"id": "route1", "pattern": "example.com/*"}
            }));
        });

        let client = client_for(&server);
        let id = client
            .create_worker_route("z1", "example.com/*", "my-worker", true)
            .unwrap();
        assert_eq!(id, "route1");
        mock.assert();
    }

    #[test]
    fn status_codes_map_onto_the_error_taxonomy() {
        let server = MockServer::start();
        for (path, status) in [
            ("/accounts/acc1/workers/scripts/gone", 404),
            ("/accounts/acc1/workers/scripts/denied", 403),
            ("/accounts/acc1/workers/scripts/flaky", 502),
            ("/accounts/acc1/workers/scripts/limited", 429),
        ] {
            server.mock(|when, then| {
                when.method(DELETE).path(path);
                then.status(status).body("error body");
            });
        }

        let client = client_for(&server);
        assert_matches!(client.delete_worker("gone"), Err(ApiError::NotFound(_)));
        assert_matches!(client.delete_worker("denied"), Err(ApiError::Auth(_)));
        assert_matches!(client.delete_worker("flaky"), Err(ApiError::Transient(_)));
        assert_matches!(
            client.delete_worker("limited"),
            Err(ApiError::QuotaExceeded(_))
        );
    }

    #[test]
    fn unsuccessful_envelope_is_malformed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/accounts/acc1/storage/kv/namespaces");
            then.status(200).json_body(serde_json::json!({
                "success": false,
                "errors": [{"code": 10014, "message": "namespace already exists"}],
                "result": null
            }));
        });

        let client = client_for(&server);
        let err = client.create_kv_namespace("dup").unwrap_err();
        assert_matches!(&err, ApiError::Malformed(msg) if msg.contains("namespace already exists"));
    }

    #[test]
    fn every_request_increments_the_api_call_counter() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/zones");
            then.status(500).body("boom");
        });

        let metrics = Arc::new(Metrics::default());
        let client = CloudflareClient::new(Client::new(), "t", "acc1", "acme", metrics.clone())
            .with_base_url(server.base_url());

        let _ = client.list_zones();
        let _ = client.list_zones();

        assert!(
            metrics
                .encode()
                .contains("cloudflare_api_calls_total{account=\"acme\"} 2")
        );
    }
}
