//! File-backed trust store
//!
//! A directory of PEM files. Membership is decided by fingerprint only,
//! so a renewed certificate with the same key counts as trusted and file
//! names carry no meaning beyond uniqueness.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use snare_discovery::{Certificate, Fingerprint};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Trust store errors
#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TrustStoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        TrustStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Directory of trusted certificates
#[derive(Debug, Clone)]
pub struct FileTrustStore {
    dir: PathBuf,
}

impl FileTrustStore {
    /// Use `dir`, which is created on first install
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every readable certificate in the store
    ///
    /// Files that are not PEM certificates are skipped.
    pub fn certificates(&self) -> Result<Vec<Certificate>, TrustStoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrustStoreError::io(&self.dir, e)),
        };

        let mut certificates = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| TrustStoreError::io(&self.dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "pem") {
                continue;
            }

            let text = std::fs::read_to_string(&path).map_err(|e| TrustStoreError::io(&path, e))?;
            match Certificate::from_pem(&text) {
                Ok(certificate) => certificates.push(certificate),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(certificates)
    }

    /// Check if a certificate with the same key is trusted
    pub fn is_trusted(&self, certificate: &Certificate) -> Result<bool, TrustStoreError> {
        let fingerprint = certificate.fingerprint();
        Ok(self
            .certificates()?
            .iter()
            .any(|c| c.fingerprint() == fingerprint))
    }

    /// Add a certificate
    ///
    /// No-op if a certificate with the same key is already trusted.
    pub fn install(&self, certificate: &Certificate) -> Result<(), TrustStoreError> {
        if self.is_trusted(certificate)? {
            debug!("Certificate {} already trusted", certificate.fingerprint());
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| TrustStoreError::io(&self.dir, e))?;

        let path = self.path_for(&certificate.fingerprint());
        std::fs::write(&path, certificate.to_pem()).map_err(|e| TrustStoreError::io(&path, e))?;

        info!("Trusted certificate {} ({})", certificate.fingerprint(), path.display());
        Ok(())
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.pem", URL_SAFE_NO_PAD.encode(fingerprint.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snare_discovery::testing::TestCertificate;

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTrustStore::new(dir.path().join("missing"));
        let cert = TestCertificate::generate("proxy.test");

        assert!(store.certificates().unwrap().is_empty());
        assert!(!store.is_trusted(&cert.certificate).unwrap());
    }

    #[test]
    fn test_install_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTrustStore::new(dir.path().join("trusted"));
        let cert = TestCertificate::generate("proxy.test");
        let other = TestCertificate::generate("other.test");

        store.install(&cert.certificate).unwrap();
        store.install(&cert.certificate).unwrap();

        assert!(store.is_trusted(&cert.certificate).unwrap());
        assert!(!store.is_trusted(&other.certificate).unwrap());
        assert_eq!(store.certificates().unwrap().len(), 1);
    }

    #[test]
    fn test_membership_ignores_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTrustStore::new(dir.path());
        let cert = TestCertificate::generate("proxy.test");

        std::fs::write(dir.path().join("whatever.pem"), &cert.pem).unwrap();
        std::fs::write(dir.path().join("notes.pem"), "not a certificate").unwrap();
        std::fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        assert!(store.is_trusted(&cert.certificate).unwrap());
    }

    #[test]
    fn test_same_key_counts_as_trusted() {
        let key = rcgen::KeyPair::generate().unwrap();
        let first = rcgen::CertificateParams::new(vec!["proxy.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let renewed = rcgen::CertificateParams::new(vec!["renewed.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = FileTrustStore::new(dir.path());
        store
            .install(&Certificate::from_der(first.der().to_vec()).unwrap())
            .unwrap();

        let renewed = Certificate::from_der(renewed.der().to_vec()).unwrap();
        assert!(store.is_trusted(&renewed).unwrap());
    }
}
