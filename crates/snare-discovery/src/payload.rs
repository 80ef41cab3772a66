//! Connect Payload
//!
//! Decodes the scanned/linked description of a proxy: candidate
//! addresses, a shared port and the expected certificate fingerprint.
//!
//! # Wire format
//!
//! ```text
//! https://<any host>/connect?data=<url-safe base64>
//!                                  │
//!                                  ▼
//! { "addresses": ["192.168.1.20", "10.0.2.2"], "port": 8000,
//!   "certFingerprint": "<padded standard base64 SHA-256>" }
//! ```
//!
//! Decoding fails closed: a missing or mistyped field invalidates the
//! whole payload.

use crate::fingerprint::Fingerprint;
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Deserialize;
use url::Url;

/// Query parameter carrying the encoded payload in a connect link
const LINK_DATA_PARAM: &str = "data";

/// URL-safe base64, padding optional
const LINK_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Payload as it appears on the wire
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    addresses: Vec<String>,
    port: u16,
    cert_fingerprint: String,
}

/// Validated connect payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePayload {
    addresses: Vec<String>,
    port: u16,
    fingerprint: Fingerprint,
}

impl CandidatePayload {
    /// Build a payload, validating every field
    pub fn new(
        addresses: impl IntoIterator<Item = impl Into<String>>,
        port: u16,
        fingerprint: Fingerprint,
    ) -> Result<Self, PayloadError> {
        let mut unique: Vec<String> = Vec::new();
        for address in addresses {
            let address = address.into().trim().to_string();
            if address.is_empty() {
                return Err(PayloadError::EmptyAddress);
            }
            if !unique.contains(&address) {
                unique.push(address);
            }
        }

        let payload = Self {
            addresses: unique,
            port,
            fingerprint,
        };
        payload.validate()?;
        Ok(payload)
    }

    /// One-address payload (reconnect to a remembered proxy)
    pub fn single(address: impl Into<String>, port: u16, fingerprint: Fingerprint) -> Result<Self, PayloadError> {
        Self::new([address.into()], port, fingerprint)
    }

    /// Decode the JSON record
    pub fn from_json(json: &[u8]) -> Result<Self, PayloadError> {
        let raw: RawPayload =
            serde_json::from_slice(json).map_err(|e| PayloadError::Malformed(e.to_string()))?;

        let fingerprint = Fingerprint::from_base64(&raw.cert_fingerprint)
            .map_err(|_| PayloadError::InvalidFingerprint)?;

        Self::new(raw.addresses, raw.port, fingerprint)
    }

    /// Decode the base64 blob embedded in a link
    pub fn from_encoded(blob: &str) -> Result<Self, PayloadError> {
        let json = LINK_BASE64
            .decode(blob.trim())
            .map_err(|_| PayloadError::Malformed("payload is not base64".into()))?;
        Self::from_json(&json)
    }

    /// Decode a scanned or deep-linked connect URL
    pub fn from_link(link: &str) -> Result<Self, PayloadError> {
        let url = Url::parse(link.trim()).map_err(|e| PayloadError::InvalidLink(e.to_string()))?;

        let data = url
            .query_pairs()
            .find(|(key, _)| key == LINK_DATA_PARAM)
            .map(|(_, value)| value.into_owned())
            .ok_or(PayloadError::MissingData)?;

        Self::from_encoded(&data)
    }

    /// Encode as a link blob (inverse of `from_encoded`)
    #[cfg(any(test, feature = "test-support"))]
    pub fn to_encoded(&self) -> String {
        let json = serde_json::json!({
            "addresses": self.addresses,
            "port": self.port,
            "certFingerprint": self.fingerprint.to_base64(),
        });
        LINK_BASE64.encode(json.to_string())
    }

    /// Check the invariants every payload must hold before probing
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.addresses.is_empty() {
            return Err(PayloadError::NoAddresses);
        }
        if self.port == 0 {
            return Err(PayloadError::InvalidPort);
        }
        Ok(())
    }

    /// Candidate addresses, in advertised order
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Port shared by every candidate
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Expected certificate fingerprint
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl std::str::FromStr for CandidatePayload {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_link(s)
    }
}

/// Payload errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload lists no candidate addresses")]
    NoAddresses,

    #[error("Payload contains an empty address")]
    EmptyAddress,

    #[error("Invalid proxy port")]
    InvalidPort,

    #[error("Invalid certificate fingerprint")]
    InvalidFingerprint,

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid connect link: {0}")]
    InvalidLink(String),

    #[error("Connect link has no payload")]
    MissingData,
}
