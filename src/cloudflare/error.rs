use reqwest::StatusCode;
use thiserror::Error;

/// Error taxonomy surfaced by the Cloudflare client. The client never retries
/// on its own; callers decide what each class means for them.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The addressed resource does not exist. Teardown treats this as
    /// "already gone".
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The token was rejected. Not recoverable without operator action.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network failure or server-side 5xx. A later attempt may succeed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rate or plan limit hit.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The payload was rejected. Retrying the same request cannot succeed.
    #[error("request rejected as malformed: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Classifies a non-2xx response into the taxonomy.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::NOT_FOUND => ApiError::NotFound(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth(body),
            StatusCode::TOO_MANY_REQUESTS => ApiError::QuotaExceeded(body),
            s if s.is_server_error() => ApiError::Transient(format!("{s}: {body}")),
            s => ApiError::Malformed(format!("{s}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transient(err.to_string())
    }
}
