//! Helpers to build the blocking reqwest clients used against Cloudflare and
//! the CrowdSec LAPI.

use super::config::{HttpConfig, TlsClientAuth};
use reqwest::blocking::Client;
use reqwest::{Certificate, Identity};
use std::fmt::Display;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum HttpBuildError {
    #[error("could not build the http client: {0}")]
    ClientBuilder(String),
    #[error("could not load certificates from {path}: {err}")]
    CertificateError { path: String, err: String },
}

/// Builds a blocking client according to the provided configuration.
pub fn build_client(config: &HttpConfig) -> Result<Client, HttpBuildError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(config.timeout)
        .connect_timeout(config.conn_timeout);

    if let Some(client_auth) = &config.client_auth {
        builder = builder.identity(identity_from_paths(client_auth)?);
        for cert in ca_certs_from_path(client_auth.ca_cert_path.as_deref())? {
            builder = builder.add_root_certificate(cert);
        }
    }

    builder
        .build()
        .map_err(|err| HttpBuildError::ClientBuilder(err.to_string()))
}

/// Loads a rustls identity from the configured certificate and key files.
/// Both files are concatenated since [Identity::from_pem] expects the chain
/// and the key in a single PEM bundle.
fn identity_from_paths(client_auth: &TlsClientAuth) -> Result<Identity, HttpBuildError> {
    let mut bundle = read_pem(&client_auth.cert_path)?;
    bundle.extend(read_pem(&client_auth.key_path)?);
    Identity::from_pem(&bundle).map_err(|err| certificate_error(&client_auth.cert_path, err))
}

/// Returns all certs bundled in the CA file, if one is configured.
fn ca_certs_from_path(path: Option<&Path>) -> Result<Vec<Certificate>, HttpBuildError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let buf = read_pem(path)?;
    Certificate::from_pem_bundle(&buf).map_err(|err| certificate_error(path, err))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, HttpBuildError> {
    std::fs::read(path).map_err(|err| certificate_error(path, err))
}

/// Helper to build a [HttpBuildError::CertificateError] more concisely.
fn certificate_error<E: Display>(path: &Path, err: E) -> HttpBuildError {
    HttpBuildError::CertificateError {
        path: path.to_string_lossy().into(),
        err: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn default_config_builds() {
        build_client(&HttpConfig::default()).unwrap();
    }

    #[test]
    fn missing_certificate_path_fails() {
        let config = HttpConfig::default().with_client_auth(Some(TlsClientAuth {
            cert_path: "non-existing.pem".into(),
            key_path: "non-existing-key.pem".into(),
            ca_cert_path: None,
        }));
        let err = build_client(&config).unwrap_err();
        assert_matches!(err, HttpBuildError::CertificateError { .. });
    }

    #[test]
    fn invalid_certificate_content_fails() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        for path in [&cert_path, &key_path] {
            let mut file = std::fs::File::create(path).unwrap();
            writeln!(file, "-----BEGIN CERTIFICATE-----\ninvalid!\n-----END CERTIFICATE-----")
                .unwrap();
        }

        let config = HttpConfig::default().with_client_auth(Some(TlsClientAuth {
            cert_path,
            key_path,
            ca_cert_path: None,
        }));
        let err = build_client(&config).unwrap_err();
        assert_matches!(err, HttpBuildError::CertificateError { .. });
    }
}
