//! Address Prober
//!
//! Performs the bootstrap exchange against one candidate address. The
//! candidate is used as an HTTP proxy: we open a plain TCP connection to
//! it and send an absolute-form `GET http://<bootstrap host>/config`,
//! which only an interception proxy will answer.
//!
//! ```text
//! probe ──TCP──▶ candidate:port ──▶ 200 {"certificate": "<PEM>"}
//!                                         │
//!                     fingerprint(cert) == expected ? ProxyConfiguration
//!                                                   : FingerprintMismatch
//! ```
//!
//! Connect and read are bounded by separate, short timeouts: most
//! candidates in a payload are guesses that will never answer.

use crate::fingerprint::{Certificate, Fingerprint};
use crate::proxy::ProxyConfiguration;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

/// Default bootstrap URL, answered by the proxy itself
pub const DEFAULT_BOOTSTRAP_URL: &str = "http://snare.bootstrap/config";

/// Probe errors
///
/// Each is fatal to one candidate only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Malformed certificate")]
    MalformedCertificate,

    #[error("Certificate fingerprint mismatch (expected {expected}, got {actual})")]
    FingerprintMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },
}

/// Prober configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Timeout for the request and the full response body
    pub read_timeout: Duration,
    /// Absolute URL requested through the candidate
    pub bootstrap_url: Uri,
    /// Maximum bootstrap response size
    pub max_body_size: usize,
    /// User-Agent string
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            bootstrap_url: Uri::from_static(DEFAULT_BOOTSTRAP_URL),
            max_body_size: 64 * 1024,
            user_agent: format!("snare/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Bootstrap response body
#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    certificate: String,
}

/// Runs bootstrap exchanges
#[derive(Debug, Clone, Default)]
pub struct Prober {
    config: ProbeConfig,
}

impl Prober {
    /// Create a new prober
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe one candidate
    ///
    /// Succeeds only if the candidate serves a certificate whose
    /// fingerprint equals `expected`.
    pub async fn probe(
        &self,
        address: &str,
        port: u16,
        expected: &Fingerprint,
    ) -> Result<ProxyConfiguration, ProbeError> {
        debug!("Probing candidate {}:{}", address, port);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((address, port)),
        )
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(connect_error)?;

        let pem = tokio::time::timeout(self.config.read_timeout, self.fetch_certificate(stream))
            .await
            .map_err(|_| ProbeError::Timeout)??;

        let certificate = Certificate::from_pem(&pem).map_err(|_| ProbeError::MalformedCertificate)?;

        let actual = certificate.fingerprint();
        if actual != *expected {
            warn!(
                "Candidate {}:{} presented an unexpected certificate ({})",
                address, port, actual
            );
            return Err(ProbeError::FingerprintMismatch {
                expected: *expected,
                actual,
            });
        }

        debug!("Candidate {}:{} verified", address, port);
        Ok(ProxyConfiguration::new(address, port, certificate))
    }

    /// Send the bootstrap request through the candidate and return the
    /// advertised certificate text
    async fn fetch_certificate(&self, stream: TcpStream) -> Result<String, ProbeError> {
        let uri = &self.config.bootstrap_url;
        let host = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| ProbeError::UnexpectedResponse("bootstrap URL has no host".into()))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .header(HOST, host)
            .header(USER_AGENT, &self.config.user_agent)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::UnexpectedResponse(e.to_string()))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::UnexpectedResponse(e.to_string()))?;

        // The connection task owns the socket; aborted when the probe ends
        let _conn = AbortOnDropHandle::new(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Bootstrap connection closed: {}", e);
            }
        }));

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProbeError::UnexpectedResponse(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProbeError::UnexpectedResponse(format!("status {}", status)));
        }

        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| ProbeError::UnexpectedResponse(e.to_string()))?
            .to_bytes();

        let parsed: BootstrapResponse = serde_json::from_slice(&body)
            .map_err(|e| ProbeError::UnexpectedResponse(format!("invalid bootstrap body: {}", e)))?;

        Ok(parsed.certificate)
    }
}

fn connect_error(e: io::Error) -> ProbeError {
    ProbeError::ConnectionRefused(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, FakeProxy, TestCertificate, refused_port};

    fn quick() -> Prober {
        Prober::new(ProbeConfig {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
            ..ProbeConfig::default()
        })
    }

    #[test]
    fn test_probe_config_defaults() {
        let config = ProbeConfig::default();

        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.read_timeout, Duration::from_secs(2));
        assert_eq!(config.bootstrap_url.host(), Some("snare.bootstrap"));
        assert_eq!(config.bootstrap_url.path(), "/config");
    }

    #[tokio::test]
    async fn test_verified_candidate() {
        let cert = TestCertificate::generate("proxy.test");
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Serve(cert.pem.clone()))
            .await
            .unwrap();

        let config = quick()
            .probe(&proxy.ip(), proxy.port(), &cert.fingerprint())
            .await
            .unwrap();

        assert_eq!(config.address(), "127.0.0.1");
        assert_eq!(config.port(), proxy.port());
        assert_eq!(config.certificate(), &cert.certificate);

        // Routed through the candidate as a proxy: absolute-form target
        let requests = proxy.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("GET http://snare.bootstrap/config HTTP/1.1"));
        assert!(requests[0].to_ascii_lowercase().contains("host: snare.bootstrap"));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_rejected() {
        let served = TestCertificate::generate("impostor.test");
        let pinned = TestCertificate::generate("proxy.test");
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Serve(served.pem.clone()))
            .await
            .unwrap();

        let result = quick()
            .probe(&proxy.ip(), proxy.port(), &pinned.fingerprint())
            .await;

        assert_eq!(
            result,
            Err(ProbeError::FingerprintMismatch {
                expected: pinned.fingerprint(),
                actual: served.fingerprint(),
            })
        );
    }

    #[tokio::test]
    async fn test_non_200_is_unexpected() {
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Status(404)).await.unwrap();

        let result = quick()
            .probe(&proxy.ip(), proxy.port(), &Fingerprint::from_bytes([0u8; 32]))
            .await;

        assert!(matches!(result, Err(ProbeError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_wrong_shape_is_unexpected() {
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Body(r#"{"cert": 1}"#.into()))
            .await
            .unwrap();

        let result = quick()
            .probe(&proxy.ip(), proxy.port(), &Fingerprint::from_bytes([0u8; 32]))
            .await;

        assert!(matches!(result, Err(ProbeError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_garbage_certificate_is_malformed() {
        let body = r#"{"certificate": "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----"}"#;
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Body(body.into()))
            .await
            .unwrap();

        let result = quick()
            .probe(&proxy.ip(), proxy.port(), &Fingerprint::from_bytes([0u8; 32]))
            .await;

        assert_eq!(result, Err(ProbeError::MalformedCertificate));
    }

    #[tokio::test]
    async fn test_oversized_body_is_unexpected() {
        let cert = TestCertificate::generate("proxy.test");
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Serve(cert.pem.clone()))
            .await
            .unwrap();

        let prober = Prober::new(ProbeConfig {
            max_body_size: 16,
            ..ProbeConfig::default()
        });
        let result = prober
            .probe(&proxy.ip(), proxy.port(), &cert.fingerprint())
            .await;

        assert!(matches!(result, Err(ProbeError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_silent_candidate_times_out_and_releases_socket() {
        let proxy = FakeProxy::spawn("127.0.0.1", 0, Behavior::Stall).await.unwrap();

        let prober = Prober::new(ProbeConfig {
            read_timeout: Duration::from_millis(200),
            ..ProbeConfig::default()
        });
        let result = prober
            .probe(&proxy.ip(), proxy.port(), &Fingerprint::from_bytes([0u8; 32]))
            .await;

        assert_eq!(result, Err(ProbeError::Timeout));
        assert!(proxy.wait_closed(1, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_refused_candidate() {
        let port = refused_port().await;

        let result = quick()
            .probe("127.0.0.1", port, &Fingerprint::from_bytes([0u8; 32]))
            .await;

        assert!(matches!(result, Err(ProbeError::ConnectionRefused(_))));
    }
}
