//! Resolved proxy configuration

use crate::fingerprint::{Certificate, Fingerprint};
use std::fmt;

/// A proxy that proved it holds the pinned certificate
///
/// Only produced by a successful probe. The certificate is kept so it can
/// be installed into the system trust store later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfiguration {
    address: String,
    port: u16,
    certificate: Certificate,
}

impl ProxyConfiguration {
    pub(crate) fn new(address: impl Into<String>, port: u16, certificate: Certificate) -> Self {
        Self {
            address: address.into(),
            port,
            certificate,
        }
    }

    /// Rebuild a configuration reported by the OS for an already-running
    /// tunnel
    ///
    /// This skips the bootstrap exchange; the caller vouches that the
    /// tunnel was started from a verified configuration.
    pub fn restored(address: impl Into<String>, port: u16, certificate: Certificate) -> Self {
        Self::new(address, port, certificate)
    }

    /// Proxy address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Proxy port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Verified certificate
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Fingerprint of the verified certificate
    pub fn fingerprint(&self) -> Fingerprint {
        self.certificate.fingerprint()
    }

    /// Proxy URL for HTTP clients
    pub fn proxy_url(&self) -> String {
        if self.address.contains(':') {
            format!("http://[{}]:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certificate() -> Certificate {
        let generated = rcgen::generate_simple_self_signed(vec!["proxy.test".to_string()]).unwrap();
        Certificate::from_der(generated.cert.der().to_vec()).unwrap()
    }

    #[test]
    fn test_proxy_url() {
        let v4 = ProxyConfiguration::new("192.168.1.20", 8000, certificate());
        assert_eq!(v4.proxy_url(), "http://192.168.1.20:8000");
        assert_eq!(v4.to_string(), "192.168.1.20:8000");

        let v6 = ProxyConfiguration::new("fe80::1", 8000, certificate());
        assert_eq!(v6.proxy_url(), "http://[fe80::1]:8000");
    }
}
