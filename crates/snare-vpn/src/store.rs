//! Last proxy store
//!
//! The one proxy worth offering again: written after every successful
//! connect, read by reconnect, cleared when a reconnect fails.

use serde::{Deserialize, Serialize};
use snare_discovery::{Certificate, CandidatePayload, FingerprintError, PayloadError, ProxyConfiguration};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Stored certificate is invalid: {0}")]
    Certificate(#[from] FingerprintError),
}

/// Persisted form of a proxy that once connected successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedProxy {
    pub address: String,
    pub port: u16,
    /// PEM
    pub certificate: String,
}

impl RememberedProxy {
    /// Remember a verified proxy
    pub fn from_proxy(proxy: &ProxyConfiguration) -> Self {
        Self {
            address: proxy.address().to_string(),
            port: proxy.port(),
            certificate: proxy.certificate().to_pem(),
        }
    }

    /// Parsed certificate
    pub fn certificate(&self) -> Result<Certificate, StoreError> {
        Ok(Certificate::from_pem(&self.certificate)?)
    }

    /// One-address payload pinned to the remembered certificate
    ///
    /// Reconnecting goes through the full race with this payload, so a
    /// remembered proxy is never reused without being verified again.
    pub fn to_payload(&self) -> Result<CandidatePayload, StoreError> {
        let fingerprint = self.certificate()?.fingerprint();
        CandidatePayload::single(self.address.clone(), self.port, fingerprint)
            .map_err(|e: PayloadError| StoreError::Corrupt(e.to_string()))
    }
}

/// Holder of the single optional remembered proxy
pub trait LastProxyStore: Send + Sync + 'static {
    /// Remembered proxy, if any
    fn load(&self) -> Result<Option<RememberedProxy>, StoreError>;

    /// Replace the remembered proxy
    fn save(&self, proxy: &RememberedProxy) -> Result<(), StoreError>;

    /// Forget the remembered proxy
    fn clear(&self) -> Result<(), StoreError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LastProxyStore for JsonFileStore {
    fn load(&self) -> Result<Option<RememberedProxy>, StoreError> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn save(&self, proxy: &RememberedProxy) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(proxy).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Write then rename, so a crash never leaves half a file behind
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Remembered proxy {}:{}", proxy.address, proxy.port);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<RememberedProxy>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a remembered proxy
    pub fn with(proxy: RememberedProxy) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(proxy))),
        }
    }
}

impl LastProxyStore for MemoryStore {
    fn load(&self) -> Result<Option<RememberedProxy>, StoreError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, proxy: &RememberedProxy) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(proxy.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snare_discovery::testing::TestCertificate;

    fn remembered() -> (TestCertificate, RememberedProxy) {
        let cert = TestCertificate::generate("proxy.test");
        let proxy = ProxyConfiguration::restored("192.168.1.20", 8000, cert.certificate.clone());
        (cert, RememberedProxy::from_proxy(&proxy))
    }

    #[test]
    fn test_remembered_payload_pins_certificate() {
        let (cert, remembered) = remembered();
        let payload = remembered.to_payload().unwrap();

        assert_eq!(payload.addresses(), ["192.168.1.20".to_string()]);
        assert_eq!(payload.port(), 8000);
        assert_eq!(payload.fingerprint(), &cert.fingerprint());
    }

    #[test]
    fn test_remembered_bad_certificate() {
        let (_, mut remembered) = remembered();
        remembered.certificate = "garbage".into();

        assert!(matches!(remembered.to_payload(), Err(StoreError::Certificate(_))));
    }

    #[test]
    fn test_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("last-proxy.json"));
        let (_, remembered) = remembered();

        assert_eq!(store.load().unwrap(), None);

        store.save(&remembered).unwrap();
        assert_eq!(store.load().unwrap(), Some(remembered.clone()));
        assert!(!store.path().with_extension("tmp").exists());

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_json_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last-proxy.json");
        std::fs::write(&path, "{\"address\": 1}").unwrap();

        assert!(matches!(JsonFileStore::new(path).load(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_memory_store_shares_slot() {
        let store = MemoryStore::new();
        let view = store.clone();
        let (_, remembered) = remembered();

        store.save(&remembered).unwrap();
        assert_eq!(view.load().unwrap(), Some(remembered));

        view.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
