//! Connection Manager
//!
//! Single source of truth for the connection lifecycle. Runs as one task
//! that owns the state, the verified proxy, the OS integration and the
//! last-proxy store; everything else talks to it through a
//! [`ConnectionHandle`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let handle = ConnectionManager::spawn(Prober::default(), os, JsonFileStore::new(path));
//!
//! // From a scanned QR code or a deep link
//! let proxy = handle.connect_link(link).await?;
//! println!("Routing through {}", proxy);
//!
//! // Later
//! handle.disconnect().await?;
//! ```
//!
//! # States
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──granted──▶ Connected
//!        ▲    ▲                    │                      │
//!        │    └─reset── Failed ◀───┘ (race failed,        │ disconnect
//!        │                           step denied)         ▼
//!        └────────── tunnel stopped ◀──────────────── Disconnecting
//! ```
//!
//! A proxy is held only while `Connecting` (once verified) and while
//! `Connected`.

use crate::os::{Consent, OsError, OsIntegration};
use crate::store::{LastProxyStore, RememberedProxy, StoreError};
use snare_discovery::{CandidateFailure, CandidatePayload, PayloadError, Prober, ProxyConfiguration, RaceError, race};
use std::fmt;
use std::future::Future;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 16;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No tunnel
    Disconnected,
    /// Discovering, verifying or activating
    Connecting,
    /// Tunnel routes through the proxy
    Connected,
    /// Teardown requested, waiting for the tunnel to stop
    Disconnecting,
    /// Last attempt failed; needs a reset or a new connect
    Failed,
}

impl ConnectionState {
    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if in a failure state
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    /// Check if a new connection attempt may start
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// Check if a proxy configuration may be held
    pub fn holds_proxy(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only view of the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub proxy: Option<ProxyConfiguration>,
    /// Why the last attempt failed
    pub last_error: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            proxy: None,
            last_error: None,
        }
    }
}

/// Activation step needing approval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    TunnelProvisioning,
    CertificateInstall,
    /// Installed, but the trust store still does not trust it
    CertificateTrust,
    TunnelActivation,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::TunnelProvisioning => "Tunnel provisioning",
            Step::CertificateInstall => "Certificate install",
            Step::CertificateTrust => "Certificate trust",
            Step::TunnelActivation => "Tunnel activation",
        };
        f.write_str(name)
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection already active ({0})")]
    AlreadyActive(ConnectionState),

    #[error("Not allowed while {0}")]
    InvalidState(ConnectionState),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("All candidates failed: {}", describe(.0))]
    AllCandidatesFailed(Vec<CandidateFailure>),

    #[error("{0} denied")]
    Denied(Step),

    #[error("No remembered proxy")]
    NoRememberedProxy,

    #[error("OS integration error: {0}")]
    Os(#[from] OsError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Connection manager stopped")]
    ControllerGone,
}

impl From<RaceError> for ConnectionError {
    fn from(e: RaceError) -> Self {
        match e {
            RaceError::InvalidPayload(e) => ConnectionError::InvalidPayload(e),
            RaceError::AllCandidatesFailed(failures) => ConnectionError::AllCandidatesFailed(failures),
        }
    }
}

fn describe(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

enum Command {
    Connect {
        payload: CandidatePayload,
        reply: Reply<ProxyConfiguration>,
    },
    ConnectLink {
        link: String,
        reply: Reply<ProxyConfiguration>,
    },
    Reconnect {
        reply: Reply<ProxyConfiguration>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Reset {
        reply: Reply<()>,
    },
    TunnelStopped,
}

/// Connection Manager
///
/// Sole writer of the connection state:
/// - Runs the discovery race for each connect
/// - Sequences trust-store and tunnel requests around its result
/// - Remembers the last verified proxy for reconnect
pub struct ConnectionManager<O, S> {
    core: Core<O, S>,
    commands: mpsc::Receiver<Command>,
}

struct Core<O, S> {
    prober: Prober,
    os: O,
    store: S,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl<O: OsIntegration, S: LastProxyStore> ConnectionManager<O, S> {
    /// Create a manager and its first handle
    ///
    /// Nothing happens until [`run`](Self::run) is polled.
    pub fn new(prober: Prober, os: O, store: S) -> (Self, ConnectionHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let manager = Self {
            core: Core {
                prober,
                os,
                store,
                snapshot: snapshot_tx,
            },
            commands: command_rx,
        };
        let handle = ConnectionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        };
        (manager, handle)
    }

    /// Create a manager and run it on the current runtime
    pub fn spawn(prober: Prober, os: O, store: S) -> ConnectionHandle {
        let (manager, handle) = Self::new(prober, os, store);
        tokio::spawn(manager.run());
        handle
    }

    /// Process commands until every handle is dropped
    ///
    /// Picks up a tunnel that is already running before the first command.
    pub async fn run(mut self) {
        self.core.restore().await;

        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
        }

        debug!("All connection handles dropped, manager stopping");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { payload, reply } => {
                let _ = reply.send(self.connect(Ok(payload), false).await);
            }
            Command::ConnectLink { link, reply } => {
                let payload = CandidatePayload::from_link(&link).map_err(ConnectionError::from);
                let _ = reply.send(self.connect(payload, false).await);
            }
            Command::Reconnect { reply } => {
                let _ = reply.send(self.reconnect().await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Reset { reply } => {
                let _ = reply.send(self.core.reset());
            }
            Command::TunnelStopped => self.core.tunnel_stopped(),
        }
    }

    async fn connect(
        &mut self,
        payload: Result<CandidatePayload, ConnectionError>,
        reconnecting: bool,
    ) -> Result<ProxyConfiguration, ConnectionError> {
        self.core.begin()?;

        let (result, _) = while_busy(&mut self.commands, &self.core, self.core.attempt(payload)).await;
        self.core.finish(result, reconnecting)
    }

    async fn reconnect(&mut self) -> Result<ProxyConfiguration, ConnectionError> {
        let state = self.core.state();
        if !state.can_connect() {
            return Err(ConnectionError::AlreadyActive(state));
        }

        // An unreadable entry fails the attempt like any other bad payload
        let payload = match self.core.store.load() {
            Ok(Some(remembered)) => {
                info!("Reconnecting to {}:{}", remembered.address, remembered.port);
                remembered.to_payload().map_err(ConnectionError::from)
            }
            Ok(None) => return Err(ConnectionError::NoRememberedProxy),
            Err(e) => Err(e.into()),
        };
        self.connect(payload, true).await
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        let state = self.core.state();
        if !state.is_connected() {
            return Err(ConnectionError::InvalidState(state));
        }

        info!("Disconnecting");
        self.core.enter(ConnectionState::Disconnecting, None, None);

        let (result, stopped) =
            while_busy(&mut self.commands, &self.core, self.core.os.teardown_tunnel()).await;

        if let Err(e) = result {
            error!("Tunnel teardown failed: {}", e);
            self.core.enter(ConnectionState::Failed, None, Some(e.to_string()));
            return Err(e.into());
        }

        // The OS may report the stop before the teardown call returns
        if stopped {
            self.core.tunnel_stopped();
        }
        Ok(())
    }
}

/// Drive `work` to completion, refusing every command that arrives
/// meanwhile
///
/// Returns whether a tunnel stop was reported during the wait.
async fn while_busy<O, S, T>(
    commands: &mut mpsc::Receiver<Command>,
    core: &Core<O, S>,
    work: impl Future<Output = T>,
) -> (T, bool) {
    tokio::pin!(work);
    let mut stopped = false;

    loop {
        tokio::select! {
            biased;
            output = &mut work => return (output, stopped),
            Some(command) = commands.recv() => {
                let state = core.state();
                match command {
                    Command::Connect { reply, .. }
                    | Command::ConnectLink { reply, .. }
                    | Command::Reconnect { reply } => {
                        debug!("Refusing connect while {}", state);
                        let _ = reply.send(Err(ConnectionError::AlreadyActive(state)));
                    }
                    Command::Disconnect { reply } | Command::Reset { reply } => {
                        let _ = reply.send(Err(ConnectionError::InvalidState(state)));
                    }
                    Command::TunnelStopped => stopped = true,
                }
            }
        }
    }
}

impl<O, S> Core<O, S> {
    fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Publish a transition
    fn enter(&self, state: ConnectionState, proxy: Option<ProxyConfiguration>, last_error: Option<String>) {
        let proxy = proxy.filter(|_| state.holds_proxy());
        let previous = self.snapshot.send_replace(ConnectionSnapshot {
            state,
            proxy,
            last_error,
        });

        if previous.state != state {
            info!("Connection state: {} -> {}", previous.state, state);
        }
    }

    fn begin(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        if !state.can_connect() {
            debug!("Ignoring connect while {}", state);
            return Err(ConnectionError::AlreadyActive(state));
        }

        self.enter(ConnectionState::Connecting, None, None);
        Ok(())
    }

    fn reset(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        if !state.is_failed() {
            return Err(ConnectionError::InvalidState(state));
        }

        self.enter(ConnectionState::Disconnected, None, None);
        Ok(())
    }

    fn tunnel_stopped(&self) {
        match self.state() {
            ConnectionState::Disconnecting => {
                info!("Tunnel stopped");
                self.enter(ConnectionState::Disconnected, None, None);
            }
            ConnectionState::Connected => {
                warn!("Tunnel stopped by the system");
                self.enter(ConnectionState::Disconnected, None, None);
            }
            state => debug!("Ignoring tunnel stop while {}", state),
        }
    }
}

impl<O: OsIntegration, S: LastProxyStore> Core<O, S> {
    async fn restore(&self) {
        match self.os.active_tunnel().await {
            Ok(Some(proxy)) => {
                info!("Found running tunnel through {}", proxy);
                self.enter(ConnectionState::Connected, Some(proxy), None);
            }
            Ok(None) => debug!("No running tunnel"),
            Err(e) => warn!("Could not query running tunnel: {}", e),
        }
    }

    async fn attempt(
        &self,
        payload: Result<CandidatePayload, ConnectionError>,
    ) -> Result<ProxyConfiguration, ConnectionError> {
        let payload = payload?;
        let proxy = race(&payload, &self.prober).await?;

        info!("Verified proxy {} ({})", proxy, proxy.fingerprint());
        self.enter(ConnectionState::Connecting, Some(proxy.clone()), None);

        self.activate(&proxy).await?;
        Ok(proxy)
    }

    /// Trust and tunnel setup for a verified proxy
    ///
    /// Prompts only for what is missing: provisioning, then certificate
    /// install, then the tunnel itself.
    async fn activate(&self, proxy: &ProxyConfiguration) -> Result<(), ConnectionError> {
        let certificate = proxy.certificate();

        let provisioned = self.os.is_tunnel_provisioned().await?;
        let trusted = self.os.is_certificate_trusted(certificate).await?;
        debug!("Tunnel provisioned: {}, certificate trusted: {}", provisioned, trusted);

        if !provisioned {
            require(self.os.provision_tunnel().await?, Step::TunnelProvisioning)?;
        }

        if !trusted {
            require(self.os.install_certificate(certificate).await?, Step::CertificateInstall)?;
            if !self.os.is_certificate_trusted(certificate).await? {
                return Err(ConnectionError::Denied(Step::CertificateTrust));
            }
        }

        require(self.os.request_tunnel(proxy).await?, Step::TunnelActivation)
    }

    fn finish(
        &self,
        result: Result<ProxyConfiguration, ConnectionError>,
        reconnecting: bool,
    ) -> Result<ProxyConfiguration, ConnectionError> {
        match result {
            Ok(proxy) => {
                self.enter(ConnectionState::Connected, Some(proxy.clone()), None);
                if let Err(e) = self.store.save(&RememberedProxy::from_proxy(&proxy)) {
                    warn!("Could not remember proxy {}: {}", proxy, e);
                }
                info!("Connected through {}", proxy);
                Ok(proxy)
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                if reconnecting {
                    self.forget();
                }
                self.enter(ConnectionState::Failed, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn forget(&self) {
        match self.store.clear() {
            Ok(()) => info!("Forgot remembered proxy"),
            Err(e) => warn!("Could not forget remembered proxy: {}", e),
        }
    }
}

fn require(consent: Consent, step: Step) -> Result<(), ConnectionError> {
    if consent.is_granted() {
        Ok(())
    } else {
        warn!("{} denied", step);
        Err(ConnectionError::Denied(step))
    }
}

/// Cloneable access to a running [`ConnectionManager`]
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    /// Connect with a decoded payload
    pub async fn connect(&self, payload: CandidatePayload) -> Result<ProxyConfiguration, ConnectionError> {
        self.request(|reply| Command::Connect { payload, reply }).await
    }

    /// Connect with a deep link or scanned QR URL
    pub async fn connect_link(&self, link: impl Into<String>) -> Result<ProxyConfiguration, ConnectionError> {
        let link = link.into();
        self.request(|reply| Command::ConnectLink { link, reply }).await
    }

    /// Verify and connect to the remembered proxy again
    pub async fn reconnect(&self) -> Result<ProxyConfiguration, ConnectionError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Request tunnel teardown
    ///
    /// Leaves the manager `Disconnecting` until
    /// [`tunnel_stopped`](Self::tunnel_stopped) is reported.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Clear a failure
    pub async fn reset(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Report that the OS tunnel has stopped
    pub async fn tunnel_stopped(&self) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::TunnelStopped)
            .await
            .map_err(|_| ConnectionError::ControllerGone)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Watch every transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the manager reaches `state`
    pub async fn wait_for(&self, state: ConnectionState) -> Result<ConnectionSnapshot, ConnectionError> {
        let mut snapshots = self.snapshot.clone();
        let snapshot = snapshots
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| ConnectionError::ControllerGone)?;
        Ok((*snapshot).clone())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ConnectionError::ControllerGone)?;
        response.await.map_err(|_| ConnectionError::ControllerGone)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snare_discovery::ProbeError;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Failed.is_failed());

        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Failed.can_connect());
        assert!(!ConnectionState::Connecting.can_connect());
        assert!(!ConnectionState::Connected.can_connect());
        assert!(!ConnectionState::Disconnecting.can_connect());
    }

    #[test]
    fn test_only_active_states_hold_proxy() {
        assert!(ConnectionState::Connecting.holds_proxy());
        assert!(ConnectionState::Connected.holds_proxy());
        assert!(!ConnectionState::Disconnected.holds_proxy());
        assert!(!ConnectionState::Disconnecting.holds_proxy());
        assert!(!ConnectionState::Failed.holds_proxy());
    }

    #[test]
    fn test_race_error_conversion() {
        let err = ConnectionError::from(RaceError::AllCandidatesFailed(vec![CandidateFailure {
            address: "10.0.0.1".into(),
            error: ProbeError::Timeout,
        }]));

        assert!(matches!(err, ConnectionError::AllCandidatesFailed(ref f) if f.len() == 1));
        assert_eq!(err.to_string(), "All candidates failed: 10.0.0.1: Probe timed out");

        let err = ConnectionError::from(RaceError::InvalidPayload(PayloadError::NoAddresses));
        assert!(matches!(err, ConnectionError::InvalidPayload(PayloadError::NoAddresses)));
    }

    #[test]
    fn test_denied_message() {
        assert_eq!(
            ConnectionError::Denied(Step::CertificateInstall).to_string(),
            "Certificate install denied"
        );
    }
}
