//! OS Integration
//!
//! The tunnel itself, the system trust store and the user prompts live
//! outside this crate. The state machine only ever talks to them through
//! [`OsIntegration`], one request and one answer at a time.

use crate::trust_store::TrustStoreError;
use async_trait::async_trait;
use snare_discovery::{Certificate, ProxyConfiguration};

/// Answer to a step that needs the user's (or the OS's) approval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Denied,
}

impl Consent {
    /// Check if the step was approved
    pub fn is_granted(&self) -> bool {
        matches!(self, Consent::Granted)
    }
}

impl From<bool> for Consent {
    fn from(granted: bool) -> Self {
        if granted { Consent::Granted } else { Consent::Denied }
    }
}

/// OS integration errors
#[derive(Debug, thiserror::Error)]
pub enum OsError {
    #[error("Tunnel service error: {0}")]
    Tunnel(String),

    #[error("Trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    #[error("Prompt failed: {0}")]
    Prompt(String),
}

/// Tunnel lifecycle, trust store and certificate install flow
#[async_trait]
pub trait OsIntegration: Send + Sync + 'static {
    /// Tunnel already running when the process starts, if any
    async fn active_tunnel(&self) -> Result<Option<ProxyConfiguration>, OsError>;

    /// Whether the tunnel profile has been set up before
    async fn is_tunnel_provisioned(&self) -> Result<bool, OsError>;

    /// Ask for permission to set up the tunnel profile
    async fn provision_tunnel(&self) -> Result<Consent, OsError>;

    /// Whether the system trusts this certificate (by fingerprint)
    async fn is_certificate_trusted(&self, certificate: &Certificate) -> Result<bool, OsError>;

    /// Run the certificate install flow
    async fn install_certificate(&self, certificate: &Certificate) -> Result<Consent, OsError>;

    /// Start routing traffic through `proxy`
    async fn request_tunnel(&self, proxy: &ProxyConfiguration) -> Result<Consent, OsError>;

    /// Stop the tunnel
    ///
    /// Completion is reported separately, see
    /// [`ConnectionHandle::tunnel_stopped`](crate::ConnectionHandle::tunnel_stopped).
    async fn teardown_tunnel(&self) -> Result<(), OsError>;
}
