//! `StudyChat` hub: WebSocket events plus the REST collaborator API.
//!
//! # Usage
//!
//! ```bash
//! # Run on the default address 0.0.0.0:9000 with one account
//! cargo run --bin studychat-hub -- --token alice-token=alice
//!
//! # Only allow two rooms
//! cargo run --bin studychat-hub -- --token t=alice --room math --room physics
//! ```

use clap::Parser;
use studychat_hub::config::{HubCliArgs, HubConfig};
use studychat_hub::hub;

#[tokio::main]
async fn main() {
    let cli = HubCliArgs::parse();

    let config = match HubConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.tokens.is_empty() {
        tracing::warn!("no tokens configured; every connection will be rejected");
    }
    tracing::info!(addr = %config.bind_addr, rooms = config.rooms.len(), "starting studychat hub");

    match hub::start_server(&config).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "hub listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "hub server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start hub");
            std::process::exit(1);
        }
    }
}
