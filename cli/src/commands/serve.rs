// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `serve`: run the bridge node until Ctrl-C.
//!
//! Every target named by a consumer domain's routes is served by an echo
//! endpoint, which makes a standalone node useful for link testing.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_bridge_core::application::BridgeRuntime;
use aegis_bridge_core::domain::bridge_config::BridgeConfigManifest;
use aegis_bridge_core::domain::events::BridgeEvent;
use aegis_bridge_core::infrastructure::event_bus::{EventBus, EventBusError};
use aegis_bridge_core::infrastructure::router::{EchoEndpoint, InMemoryRouter};

#[derive(Args)]
pub struct ServeArgs {
    /// Print bridge events to stdout
    #[arg(long)]
    events: bool,
}

pub async fn run(args: ServeArgs, config_path: Option<PathBuf>, log_level: &str) -> Result<()> {
    let config = BridgeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    let format = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.logging.as_ref())
        .map(|l| l.format.clone())
        .unwrap_or_else(|| "text".to_string());
    crate::init_logging(log_level, &format)?;

    config.validate().context("Configuration validation failed")?;

    let router = Arc::new(InMemoryRouter::new(Duration::from_secs(
        config.spec.transport.exchange_timeout_seconds,
    )));
    let targets: BTreeSet<&str> = config
        .spec
        .consumer_domains
        .iter()
        .flat_map(|domain| domain.services.iter().map(|route| route.target.as_str()))
        .collect();
    for target in targets {
        router.register_endpoint(target, Arc::new(EchoEndpoint));
    }

    let event_bus = EventBus::with_default_capacity();
    if args.events {
        tokio::spawn(print_events(event_bus.clone()));
    }

    let shutdown = CancellationToken::new();
    let runtime = BridgeRuntime::start(&config, router, event_bus, shutdown.clone())
        .await
        .context("Failed to start bridge runtime")?;

    println!("{}", format!("✓ Bridge '{}' running", config.metadata.name).green());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    runtime.shutdown();
    runtime.wait().await;

    println!("{}", "Bridge stopped".dimmed());
    Ok(())
}

async fn print_events(event_bus: EventBus) {
    let mut receiver = event_bus.subscribe();
    loop {
        match receiver.recv().await {
            Ok(event) => println!("{}", describe(&event)),
            Err(EventBusError::Lagged(_)) => continue,
            Err(e) => {
                warn!(error = %e, "Event stream ended");
                break;
            }
        }
    }
}

fn describe(event: &BridgeEvent) -> String {
    match event {
        BridgeEvent::ConnectionAdmitted { peer, side, ssl_type, .. } => {
            format!("{} {} ({:?}, {})", "admitted".green(), peer, side, ssl_type)
        }
        BridgeEvent::HandshakeFailed { peer_address, reason, .. } => {
            format!("{} {}: {}", "refused".red(), peer_address, reason)
        }
        BridgeEvent::ConnectionClosed {
            peer,
            dropped_exchanges,
            ..
        } => format!("{} {} ({} exchanges dropped)", "closed".yellow(), peer, dropped_exchanges),
        BridgeEvent::ExchangeAbandoned { exchange_id, reason, .. } => {
            format!("{} {}: {}", "abandoned".red(), exchange_id, reason)
        }
    }
}
