use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build-time settings for the blocking HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub conn_timeout: Duration,
    /// Mutual-TLS material presented to the upstream, when configured.
    pub client_auth: Option<TlsClientAuth>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            client_auth: None,
        }
    }
}

impl HttpConfig {
    pub fn with_client_auth(self, client_auth: Option<TlsClientAuth>) -> Self {
        Self {
            client_auth,
            ..self
        }
    }
}

/// Paths to PEM-encoded client certificate, key and optional CA bundle.
#[derive(Debug, Clone)]
pub struct TlsClientAuth {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_cert_path: Option<PathBuf>,
}
