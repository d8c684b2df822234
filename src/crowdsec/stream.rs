//! Client for the LAPI decision stream.
//!
//! One fetch per tick: the first fetch of a fresh namespace requests the full
//! snapshot (`startup=true`), later fetches request the incremental diff. A
//! `204 No Content` means no decision exists anywhere upstream and maps to
//! [StreamResponse::Reset].

use super::decision::{Decision, RawDecision, normalize};
use crate::defaults::user_agent;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

const STREAM_PATH: &str = "v1/decisions/stream";
const SUPPORTED_SCOPES: &str = "ip,range,as,country";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid LAPI url: {0}")]
    InvalidUrl(String),
    #[error("could not reach LAPI: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("LAPI rejected the stream request: {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("undecodable stream response: {0}")]
    Decode(String),
}

/// A batch of normalized decisions, deletions and additions.
#[derive(Debug, Default)]
pub struct DecisionSet {
    pub new: Vec<Decision>,
    pub deleted: Vec<Decision>,
}

impl DecisionSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug)]
pub enum StreamResponse {
    Batch(DecisionSet),
    /// Upstream holds no decisions at all: every mirrored decision key must
    /// be purged.
    Reset,
}

/// Seam between the orchestrator and the LAPI transport.
#[cfg_attr(test, mockall::automock)]
pub trait DecisionSource: Send {
    fn fetch(&self, startup: bool) -> Result<StreamResponse, StreamError>;
}

#[derive(Debug, Deserialize)]
struct RawStreamResponse {
    #[serde(default)]
    new: Option<Vec<RawDecision>>,
    #[serde(default)]
    deleted: Option<Vec<RawDecision>>,
}

pub struct StreamClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    origins: Option<String>,
    scenarios_containing: Option<String>,
    scenarios_not_containing: Option<String>,
}

impl StreamClient {
    pub fn new(http: Client, lapi_url: &Url, api_key: impl Into<String>) -> Result<Self, StreamError> {
        let endpoint = lapi_url
            .join(STREAM_PATH)
            .map_err(|err| StreamError::InvalidUrl(err.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
            origins: None,
            scenarios_containing: None,
            scenarios_not_containing: None,
        })
    }

    /// Installs the optional scenario and origin filters, comma-joined into
    /// the query parameters LAPI expects. Empty lists mean "no filter".
    pub fn with_filters(
        self,
        origins: &[String],
        scenarios_containing: &[String],
        scenarios_not_containing: &[String],
    ) -> Self {
        let join = |values: &[String]| {
            if values.is_empty() {
                None
            } else {
                Some(values.join(","))
            }
        };
        Self {
            origins: join(origins),
            scenarios_containing: join(scenarios_containing),
            scenarios_not_containing: join(scenarios_not_containing),
            ..self
        }
    }
}

impl DecisionSource for StreamClient {
    fn fetch(&self, startup: bool) -> Result<StreamResponse, StreamError> {
        let mut request = self
            .http
            .get(self.endpoint.clone())
            .header("X-Api-Key", &self.api_key)
            .header(reqwest::header::USER_AGENT, user_agent())
            .query(&[
                ("startup", if startup { "true" } else { "false" }),
                ("scopes", SUPPORTED_SCOPES),
            ]);
        if let Some(origins) = &self.origins {
            request = request.query(&[("origins", origins)]);
        }
        if let Some(containing) = &self.scenarios_containing {
            request = request.query(&[("scenarios_containing", containing)]);
        }
        if let Some(not_containing) = &self.scenarios_not_containing {
            request = request.query(&[("scenarios_not_containing", not_containing)]);
        }

        let response = request.send()?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            debug!("LAPI returned no content, all decisions are gone upstream");
            return Ok(StreamResponse::Reset);
        }
        let body = response.text()?;
        if !status.is_success() {
            return Err(StreamError::Upstream { status, body });
        }

        let raw: RawStreamResponse =
            serde_json::from_str(&body).map_err(|err| StreamError::Decode(err.to_string()))?;
        Ok(StreamResponse::Batch(DecisionSet {
            new: normalize(raw.new.unwrap_or_default()).collect(),
            deleted: normalize(raw.deleted.unwrap_or_default()).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crowdsec::decision::Scope;
    use assert_matches::assert_matches;
    use httpmock::Method::GET;
    use httpmock::MockServer;

    fn stream_for(server: &MockServer) -> StreamClient {
        let url: Url = server.base_url().parse().unwrap();
        StreamClient::new(Client::new(), &url, "stream-key").unwrap()
    }

    #[test]
    fn fetch_sends_credentials_and_startup_flag() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/decisions/stream")
                .header("X-Api-Key", "stream-key")
                .query_param("startup", "true")
                .query_param("scopes", "ip,range,as,country");
            then.status(200).json_body(serde_json::json!({
                "new": [{
                    "origin": "CAPI", "type": "BAN", "scope": "IP",
                    "value": "1.2.3.4", "duration": "4h", "scenario": "probing"
                }],
                "deleted": null
            }));
        });

        let response = stream_for(&server).fetch(true).unwrap();
        mock.assert();

        let set = assert_matches!(response, StreamResponse::Batch(set) => set);
        assert_eq!(set.new.len(), 1);
        assert!(set.deleted.is_empty());
        assert_eq!(set.new[0].scope, Scope::Ip);
        assert_eq!(set.new[0].remediation, "ban");
        assert_eq!(set.new[0].origin, "capi");
    }

    #[test]
    fn incremental_fetch_sets_startup_false() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/decisions/stream")
                .query_param("startup", "false");
            then.status(200)
                .json_body(serde_json::json!({"new": null, "deleted": null}));
        });

        let response = stream_for(&server).fetch(false).unwrap();
        mock.assert();
        let set = assert_matches!(response, StreamResponse::Batch(set) => set);
        assert!(set.is_empty());
    }

    #[test]
    fn scenario_filters_become_query_parameters() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/decisions/stream")
                .query_param("origins", "crowdsec,lists")
                .query_param("scenarios_containing", "http")
                .query_param("scenarios_not_containing", "ssh,ftp");
            then.status(200)
                .json_body(serde_json::json!({"new": null, "deleted": null}));
        });

        let stream = stream_for(&server).with_filters(
            &["crowdsec".into(), "lists".into()],
            &["http".into()],
            &["ssh".into(), "ftp".into()],
        );
        stream.fetch(false).unwrap();
        mock.assert();
    }

    #[test]
    fn no_content_maps_to_reset() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/decisions/stream");
            then.status(204);
        });

        let response = stream_for(&server).fetch(false).unwrap();
        assert_matches!(response, StreamResponse::Reset);
    }

    #[test]
    fn upstream_errors_carry_status_and_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/decisions/stream");
            then.status(403).body("invalid api key");
        });

        let err = stream_for(&server).fetch(false).unwrap_err();
        assert_matches!(
            err,
            StreamError::Upstream { status, body }
                if status == StatusCode::FORBIDDEN && body.contains("invalid api key")
        );
    }
}
