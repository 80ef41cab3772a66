//! Fingerprint Engine
//!
//! Computes the identity of a proxy certificate: SHA-256 over the DER
//! encoded SubjectPublicKeyInfo, rendered as padded standard base64.
//!
//! Only the public key is hashed, so a certificate renewed with the same
//! key keeps its fingerprint.
//!
//! ```text
//! PEM ──▶ DER ──▶ X.509 ──▶ SPKI bytes ──▶ SHA-256 ──▶ base64 (44 chars)
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use std::fmt;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// PEM label accepted for certificates
const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// SHA-256 of a certificate's SubjectPublicKeyInfo
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a DER-encoded certificate
    pub fn of_der(cert_der: &[u8]) -> Result<Self, FingerprintError> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|_| FingerprintError::InvalidCertificate)?;

        let digest = Sha256::digest(cert.public_key().raw);

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Ok(Self(arr))
    }

    /// Create from raw digest bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse an advertised fingerprint (padded standard base64)
    pub fn from_base64(s: &str) -> Result<Self, FingerprintError> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|_| FingerprintError::InvalidBase64)?;

        if bytes.len() != 32 {
            return Err(FingerprintError::InvalidLength);
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Canonical encoding, as carried in connect payloads
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Raw digest bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_base64())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

/// A parsed X.509 certificate
///
/// Holds the DER bytes for later trust-store installation and the
/// fingerprint computed once at parse time.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    fingerprint: Fingerprint,
}

impl Certificate {
    /// Parse a DER-encoded certificate
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self, FingerprintError> {
        let der = der.into();
        let fingerprint = Fingerprint::of_der(&der)?;
        Ok(Self { der, fingerprint })
    }

    /// Parse a PEM-encoded certificate
    pub fn from_pem(pem_text: &str) -> Result<Self, FingerprintError> {
        let block = pem::parse(pem_text.trim()).map_err(|_| FingerprintError::InvalidCertificate)?;
        if block.tag() != PEM_CERTIFICATE_TAG {
            return Err(FingerprintError::InvalidCertificate);
        }
        Self::from_der(block.into_contents())
    }

    /// DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Encode as PEM
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_CERTIFICATE_TAG, self.der.clone()))
    }

    /// Identity fingerprint of this certificate's public key
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Fingerprint errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("Invalid certificate")]
    InvalidCertificate,

    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid fingerprint length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let cert = rcgen::generate_simple_self_signed(vec!["proxy.test".to_string()]).unwrap();

        let fp1 = Fingerprint::of_der(cert.cert.der()).unwrap();
        let fp2 = Fingerprint::of_der(cert.cert.der()).unwrap();

        assert_eq!(fp1, fp2);
        assert_eq!(fp1.to_base64(), fp2.to_base64());
        assert_eq!(fp1.to_base64().len(), 44);
    }

    #[test]
    fn test_same_key_same_fingerprint() {
        let key_pair = rcgen::KeyPair::generate().unwrap();

        let mut params1 = rcgen::CertificateParams::new(vec!["proxy.test".to_string()]).unwrap();
        params1.serial_number = Some(rcgen::SerialNumber::from(1u64));
        let renewed = rcgen::CertificateParams::new(vec!["renewed.test".to_string()]).unwrap();

        let cert1 = params1.self_signed(&key_pair).unwrap();
        let cert2 = renewed.self_signed(&key_pair).unwrap();

        assert_ne!(&cert1.der()[..], &cert2.der()[..]);
        assert_eq!(
            Fingerprint::of_der(cert1.der()).unwrap(),
            Fingerprint::of_der(cert2.der()).unwrap()
        );
    }

    #[test]
    fn test_different_keys_differ() {
        let a = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let b = rcgen::generate_simple_self_signed(vec!["b.test".to_string()]).unwrap();

        assert_ne!(
            Fingerprint::of_der(a.cert.der()).unwrap(),
            Fingerprint::of_der(b.cert.der()).unwrap()
        );
    }

    #[test]
    fn test_certificate_from_pem() {
        let generated = rcgen::generate_simple_self_signed(vec!["proxy.test".to_string()]).unwrap();
        let cert = Certificate::from_pem(&generated.cert.pem()).unwrap();

        assert_eq!(cert.der(), &generated.cert.der()[..]);
        assert_eq!(cert.fingerprint(), Fingerprint::of_der(generated.cert.der()).unwrap());

        let reparsed = Certificate::from_pem(&cert.to_pem()).unwrap();
        assert_eq!(reparsed, cert);
    }

    #[test]
    fn test_invalid_certificates() {
        assert_eq!(
            Certificate::from_der(vec![0x30, 0x03, 0x01, 0x02, 0x03]),
            Err(FingerprintError::InvalidCertificate)
        );
        assert_eq!(
            Certificate::from_pem("not a certificate"),
            Err(FingerprintError::InvalidCertificate)
        );

        let key = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3]));
        assert_eq!(Certificate::from_pem(&key), Err(FingerprintError::InvalidCertificate));
    }

    #[test]
    fn test_parse_fingerprint() {
        let fp = Fingerprint::from_bytes([7u8; 32]);
        let parsed: Fingerprint = fp.to_base64().parse().unwrap();
        assert_eq!(parsed, fp);

        assert_eq!(
            Fingerprint::from_base64("not-base64!!"),
            Err(FingerprintError::InvalidBase64)
        );
        assert_eq!(
            Fingerprint::from_base64(&BASE64.encode([1u8; 16])),
            Err(FingerprintError::InvalidLength)
        );
    }
}
