//! Discovery Race
//!
//! Probes every candidate address of a payload concurrently and returns
//! the first verified proxy.
//!
//! # Cancellation
//!
//! ```text
//!            ┌─▶ probe(A) ──┐
//! payload ───┼─▶ probe(B) ──┼──▶ results ──▶ first Ok ──▶ cancel ──▶ join all
//!            └─▶ probe(C) ──┘
//! ```
//!
//! Every probe task selects on a shared cancellation token. The first
//! success cancels the token immediately, and `race` only returns once
//! every task has finished, so no losing probe keeps a socket open.
//! Dropping the race future cancels the token as well.

use crate::fingerprint::Fingerprint;
use crate::payload::{CandidatePayload, PayloadError};
use crate::probe::{ProbeError, Prober};
use crate::proxy::ProxyConfiguration;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why one candidate lost the race
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    /// Candidate address
    pub address: String,
    /// Probe outcome
    pub error: ProbeError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.error)
    }
}

/// Race errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaceError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("All candidates failed: {}", describe(.0))]
    AllCandidatesFailed(Vec<CandidateFailure>),
}

fn describe(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolve a payload to a verified proxy
pub async fn race(payload: &CandidatePayload, prober: &Prober) -> Result<ProxyConfiguration, RaceError> {
    payload.validate()?;

    let port = payload.port();
    let expected = *payload.fingerprint();

    if let [address] = payload.addresses() {
        return prober
            .probe(address, port, &expected)
            .await
            .map_err(|error| {
                warn!("Candidate {} failed: {}", address, error);
                RaceError::AllCandidatesFailed(vec![CandidateFailure {
                    address: address.clone(),
                    error,
                }])
            });
    }

    race_all(payload.addresses(), port, expected, prober).await
}

async fn race_all(
    addresses: &[String],
    port: u16,
    expected: Fingerprint,
    prober: &Prober,
) -> Result<ProxyConfiguration, RaceError> {
    info!("Racing {} candidates on port {}", addresses.len(), port);

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let prober = Arc::new(prober.clone());
    let (tx, mut rx) = mpsc::channel(addresses.len());
    let mut tasks = Vec::with_capacity(addresses.len());

    for (index, address) in addresses.iter().enumerate() {
        let cancel = cancel.clone();
        let prober = prober.clone();
        let address = address.clone();
        let tx = tx.clone();

        tasks.push(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Probe of {} cancelled", address);
                }
                result = prober.probe(&address, port, &expected) => {
                    // Capacity covers every candidate, so this never waits
                    let _ = tx.send((index, result)).await;
                }
            }
        }));
    }
    drop(tx);

    let mut winner = None;
    let mut failures = Vec::new();

    while let Some((index, result)) = rx.recv().await {
        match result {
            Ok(proxy) => {
                winner = Some(proxy);
                break;
            }
            Err(error) => {
                warn!("Candidate {} failed: {}", addresses[index], error);
                failures.push((index, error));
            }
        }
    }

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Probe task ended abnormally: {}", e);
        }
    }

    match winner {
        Some(proxy) => {
            info!("Candidate {} won the race", proxy);
            Ok(proxy)
        }
        None => {
            failures.sort_by_key(|(index, _)| *index);
            Err(RaceError::AllCandidatesFailed(
                failures
                    .into_iter()
                    .map(|(index, error)| CandidateFailure {
                        address: addresses[index].clone(),
                        error,
                    })
                    .collect(),
            ))
        }
    }
}
