//! # Relay MongoDB - CDC Sink Daemon
//!
//! Subscribes to change events on the event bus, fans them out across the
//! subscription rule table, and applies them to MongoDB collections with
//! unordered bulk writes. The upstream message is acknowledged only after
//! every fan-out sibling has been persisted.
//!
//! ## Usage
//!
//! ```bash
//! # Run with settings from ./config.{toml,yaml,json} and rules from the
//! # configured rule file
//! relay-mongodb --config config
//!
//! # Enable debug logging
//! RUST_LOG=debug relay-mongodb --config config
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_core::{RuleConfig, Settings};
use relay_io::bus::{BusClient, BusOptions};
use relay_io::router::{AckCoordinator, Router};
use relay_io::writer::Writer;

/// Grace window for in-flight chunks after intake stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments for the sink daemon
#[derive(Parser, Debug)]
#[command(name = "relay-mongodb")]
#[command(about = "MongoDB sink for CDC event streams")]
struct Args {
    /// Settings file name; the extension is resolved by the config loader
    #[arg(short, long, default_value = "config")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("starting application");

    let settings = Settings::load(&args.config).context("loading settings")?;
    info!(path = %settings.rules.subscription.display(), "loading rules");
    let rules = Arc::new(
        RuleConfig::load(&settings.rules.subscription).context("loading subscription rules")?,
    );

    let writer = Arc::new(
        Writer::init(&settings, Arc::new(AckCoordinator))
            .await
            .context("initializing writer")?,
    );
    let router = Arc::new(Router::new(Arc::clone(&rules), writer));

    let mut bus = BusClient::connect(BusOptions::from_settings(&settings))
        .await
        .context("connecting to event bus")?;
    bus.register().await.context("registering subscriber")?;
    bus.subscribe_to_collections(&rules)
        .await
        .context("subscribing to collections")?;
    bus.subscribe_to_pipelines()
        .await
        .context("subscribing to pipelines")?;

    let cancel = CancellationToken::new();
    bus.start(router, cancel.child_token())
        .await
        .context("starting subscription")?;

    wait_for_shutdown().await.context("waiting for signals")?;
    info!("shutting down, stopping intake");
    cancel.cancel();
    bus.disconnect().await;

    // No drain barrier on the writer; in-flight chunks get the grace window
    // and anything left unacked is replayed by the source.
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("Bye!");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
