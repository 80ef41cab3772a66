//! snare: connect to an interception proxy from a scanned link
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! and runs one command against the discovery race or the connection
//! manager.

mod headless;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use headless::{HeadlessIntegration, Prompter};
use snare_discovery::{CandidatePayload, Certificate, Prober, RaceError, race};
use snare_vpn::{
    ConnectionHandle, ConnectionManager, ConnectionState, FileTrustStore, JsonFileStore, SnareConfig,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "snare")]
#[command(about = "Discover, verify and connect to an interception proxy")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SNARE_CONFIG")]
    config: Option<PathBuf>,

    /// Approve every prompt without asking
    #[arg(short, long)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fingerprint of a PEM certificate
    Fingerprint {
        /// Certificate file
        pem: PathBuf,
    },

    /// Find the proxy a connect link points at, without connecting
    Probe {
        /// Scanned or deep-linked connect URL
        link: String,
    },

    /// Connect through the proxy a link points at, until Ctrl-C
    Connect {
        /// Scanned or deep-linked connect URL
        link: String,
    },

    /// Verify and connect to the last proxy again, until Ctrl-C
    Reconnect,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => SnareConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SnareConfig::default(),
    };

    match cli.command {
        Commands::Fingerprint { pem } => fingerprint(&pem),
        Commands::Probe { link } => probe(&config, &link).await,
        Commands::Connect { link } => {
            let handle = start(&config, cli.yes)?;
            handle.connect_link(link).await.context("Connection failed")?;
            hold(&handle).await
        }
        Commands::Reconnect => {
            let handle = start(&config, cli.yes)?;
            handle.reconnect().await.context("Reconnect failed")?;
            hold(&handle).await
        }
    }
}

fn fingerprint(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let certificate = Certificate::from_pem(&text)
        .with_context(|| format!("{} is not a PEM certificate", path.display()))?;

    println!("{}", certificate.fingerprint());
    Ok(())
}

async fn probe(config: &SnareConfig, link: &str) -> Result<()> {
    let payload = CandidatePayload::from_link(link).context("Invalid connect link")?;
    let prober = Prober::new(config.probe_config()?);

    match race(&payload, &prober).await {
        Ok(proxy) => {
            println!("{} {}", proxy, proxy.fingerprint());
            Ok(())
        }
        Err(RaceError::AllCandidatesFailed(failures)) => {
            for failure in &failures {
                eprintln!("  {}", failure);
            }
            bail!("No candidate answered with the pinned certificate");
        }
        Err(e) => Err(e.into()),
    }
}

fn start(config: &SnareConfig, assume_yes: bool) -> Result<ConnectionHandle> {
    let prober = Prober::new(config.probe_config()?);
    let os = HeadlessIntegration::new(
        FileTrustStore::new(&config.storage.trust_store_dir),
        Prompter::new(assume_yes),
    );
    let store = JsonFileStore::new(&config.storage.last_proxy_path);

    Ok(ConnectionManager::spawn(prober, os, store))
}

/// Keep the route up until Ctrl-C, then tear it down
async fn hold(handle: &ConnectionHandle) -> Result<()> {
    if let Some(proxy) = handle.snapshot().proxy {
        println!("Connected through {} (proxy URL {})", proxy, proxy.proxy_url());
    }

    let mut snapshots = handle.subscribe();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl-C")?,
        _ = snapshots.wait_for(|s| s.state != ConnectionState::Connected) => {
            info!("Connection ended");
            return Ok(());
        }
    }

    info!("Shutting down");
    handle.disconnect().await.context("Disconnect failed")?;

    // The in-process route is gone once teardown returns
    handle.tunnel_stopped().await?;
    handle.wait_for(ConnectionState::Disconnected).await?;

    println!("Disconnected");
    Ok(())
}
