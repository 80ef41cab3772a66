//! snare discovery - find and pin an interception proxy
//!
//! Turns a scanned connect payload into a verified proxy configuration.
//!
//! Architecture:
//! 1. Link/QR payload → `CandidatePayload` (addresses, port, fingerprint)
//! 2. One probe per address, concurrently, each routed *through* the
//!    candidate as an HTTP proxy
//! 3. Each probe fetches the proxy's certificate and compares its SPKI
//!    fingerprint with the pinned one
//! 4. First verified candidate wins, the rest are cancelled
//!
//! There is no PKI here: trust comes entirely from the fingerprint carried
//! out-of-band in the payload.

mod fingerprint;
mod payload;
mod probe;
mod proxy;
mod race;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use fingerprint::{Certificate, Fingerprint, FingerprintError};
pub use payload::{CandidatePayload, PayloadError};
pub use probe::{DEFAULT_BOOTSTRAP_URL, ProbeConfig, ProbeError, Prober};
pub use proxy::ProxyConfiguration;
pub use race::{CandidateFailure, RaceError, race};

pub use hyper::Uri;
