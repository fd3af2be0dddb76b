//! Node Untaint Controller
//!
//! Removes a startup taint from nodes once the node-local workloads it
//! waits for are ready.
//!
//! A node that joins the cluster carrying the target taint keeps it until
//! every pod on the node owned by one of the configured workloads (matched
//! by owner reference name) reports `Ready=True`. Until then the node is
//! rechecked every 30 seconds.
//!
//! ## Usage
//!
//! ```bash
//! node-untaint-controller \
//!     --target-taint node.example.com/agent-not-ready \
//!     --owned-by-names cilium,ebs-csi-node
//!
//! # Same thing from the environment, with debug logs
//! TARGET_TAINT=node.example.com/agent-not-ready OWNED_BY_NAMES=cilium \
//!     RUST_LOG=debug node-untaint-controller
//! ```

mod backoff;
mod config;
mod controller;
mod error;
mod filter;
mod http;
mod leader_election;
mod metrics;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use anyhow::Context as _;
use clap::Parser;
use config::{LogFormat, Settings};
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    init_tracing(settings.log_format);

    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    ) {
        debug!(?e, "CryptoProvider already installed; proceeding");
    }

    info!("Starting Node Untaint Controller");

    let config = settings
        .untaint_config()
        .context("Failed to load configuration")?;

    info!("Configuration:");
    info!("  Target taint: {}", config.target_taint());
    info!("  Owned by names: {:?}", config.owned_by_names());
    info!("  Leader election: {}", settings.leader_elect);
    info!("  Max concurrent reconciles: {}", settings.max_concurrent_reconciles);
    info!("  Reconcile timeout: {}s", settings.reconcile_timeout_secs);

    let controller = Controller::new(&settings, config)
        .await
        .context("Failed to initialize controller")?;
    controller.run().await.context("Controller failed")?;

    Ok(())
}
