//! snare VPN - Connection lifecycle around a verified proxy
//!
//! Drives discovery, trust-store setup and tunnel activation as one state
//! machine, with the OS side kept behind a trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     snare process                        │
//! │                                                          │
//! │  ┌────────────┐  commands  ┌───────────────────┐         │
//! │  │ Connection │───────────▶│ ConnectionManager │         │
//! │  │  Handle    │◀───────────│ (single writer)   │         │
//! │  └────────────┘  snapshots └─────────┬─────────┘         │
//! │                                      │                   │
//! │                   ┌──────────────────┼───────────────┐   │
//! │                   ▼                  ▼               ▼   │
//! │           ┌──────────────┐  ┌────────────────┐ ┌───────┐ │
//! │           │ race/probe   │  │ OsIntegration  │ │ Store │ │
//! │           │ (discovery)  │  │ trust + tunnel │ │       │ │
//! │           └──────────────┘  └────────────────┘ └───────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Trust
//!
//! - A proxy is accepted only after the discovery race verifies its
//!   certificate fingerprint
//! - Reconnect verifies the remembered proxy again and forgets it on failure
//! - Every approval step can be declined, which fails the attempt

mod config;
mod manager;
mod os;
mod store;
mod trust_store;

pub use config::{ConfigError, ProbeSettings, SnareConfig, StorageSettings};
pub use manager::{
    ConnectionError, ConnectionHandle, ConnectionManager, ConnectionSnapshot, ConnectionState, Step,
};
pub use os::{Consent, OsError, OsIntegration};
pub use store::{JsonFileStore, LastProxyStore, MemoryStore, RememberedProxy, StoreError};
pub use trust_store::{FileTrustStore, TrustStoreError};
