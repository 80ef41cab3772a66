//! Headless OS integration
//!
//! Stands in for the platform tunnel service on a desktop or server: the
//! "tunnel" is an in-process route record, certificates go into a
//! [`FileTrustStore`], and approvals are asked on the terminal (or
//! granted up front with `--yes`).

use async_trait::async_trait;
use snare_discovery::{Certificate, ProxyConfiguration};
use snare_vpn::{Consent, FileTrustStore, OsError, OsIntegration};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tracing::info;

/// Asks yes/no questions on the terminal
pub struct Prompter {
    assume_yes: bool,
    input: tokio::sync::Mutex<BufReader<Stdin>>,
}

impl Prompter {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            input: tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    /// Ask `question`; anything but y/yes is a no
    pub async fn confirm(&self, question: &str) -> Result<Consent, OsError> {
        if self.assume_yes {
            info!("{} [auto-approved]", question);
            return Ok(Consent::Granted);
        }

        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(format!("{} [y/N] ", question).as_bytes())
            .await
            .map_err(|e| OsError::Prompt(e.to_string()))?;
        stderr.flush().await.map_err(|e| OsError::Prompt(e.to_string()))?;

        let mut line = String::new();
        self.input
            .lock()
            .await
            .read_line(&mut line)
            .await
            .map_err(|e| OsError::Prompt(e.to_string()))?;

        Ok(is_yes(&line).into())
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Terminal-driven integration
pub struct HeadlessIntegration {
    trust_store: FileTrustStore,
    prompter: Prompter,
    provisioned: AtomicBool,
    route: Mutex<Option<ProxyConfiguration>>,
}

impl HeadlessIntegration {
    pub fn new(trust_store: FileTrustStore, prompter: Prompter) -> Self {
        Self {
            trust_store,
            prompter,
            provisioned: AtomicBool::new(false),
            route: Mutex::new(None),
        }
    }

    fn route(&self) -> std::sync::MutexGuard<'_, Option<ProxyConfiguration>> {
        self.route.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OsIntegration for HeadlessIntegration {
    async fn active_tunnel(&self) -> Result<Option<ProxyConfiguration>, OsError> {
        Ok(self.route().clone())
    }

    async fn is_tunnel_provisioned(&self) -> Result<bool, OsError> {
        Ok(self.provisioned.load(Ordering::SeqCst))
    }

    async fn provision_tunnel(&self) -> Result<Consent, OsError> {
        let consent = self
            .prompter
            .confirm("Allow snare to route this session's traffic through a proxy?")
            .await?;
        if consent.is_granted() {
            self.provisioned.store(true, Ordering::SeqCst);
        }
        Ok(consent)
    }

    async fn is_certificate_trusted(&self, certificate: &Certificate) -> Result<bool, OsError> {
        Ok(self.trust_store.is_trusted(certificate)?)
    }

    async fn install_certificate(&self, certificate: &Certificate) -> Result<Consent, OsError> {
        let question = format!(
            "Trust proxy certificate {} (stored in {})?",
            certificate.fingerprint(),
            self.trust_store.dir().display()
        );
        let consent = self.prompter.confirm(&question).await?;
        if consent.is_granted() {
            self.trust_store.install(certificate)?;
        }
        Ok(consent)
    }

    async fn request_tunnel(&self, proxy: &ProxyConfiguration) -> Result<Consent, OsError> {
        let consent = self
            .prompter
            .confirm(&format!("Route traffic through {}?", proxy))
            .await?;
        if consent.is_granted() {
            *self.route() = Some(proxy.clone());
            info!("Route active: use {} as your HTTP proxy", proxy.proxy_url());
        }
        Ok(consent)
    }

    async fn teardown_tunnel(&self) -> Result<(), OsError> {
        if let Some(proxy) = self.route().take() {
            info!("Route through {} removed", proxy);
        }
        Ok(())
    }
}
