//! peerwired - encrypted node link daemon
//!
//! Brings up the cipher strategy, the two readiness loops and the listener,
//! dials the configured peers and runs until interrupted.

use clap::Parser;
use peerwired::config::{Command, Config, ServeArgs};
use peerwired::{build_cipher_strategy, keygen, Node};
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sent on every dialed link once it is up
const HELLO: &[u8] = b"HELLO";

fn init_logging(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "peerwired={level},peerwire_net={level},peerwire_crypto={level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    info!(
        "peerwired v{} - encrypted node link daemon",
        env!("CARGO_PKG_VERSION")
    );

    match config.command {
        Command::Keygen(args) => match keygen(&args) {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Key generation failed: {:#}", e);
                ExitCode::FAILURE
            }
        },
        Command::Serve(args) => match serve(args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Node failed: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let encryption = args.encryption.to_config()?;
    // A configured cipher that cannot be built stops the node here
    let cipher = build_cipher_strategy(&encryption)?;

    let node = Node::new(cipher)?;
    node.listen(args.listen)?;

    let timeout = Duration::from_secs(args.connect_timeout_secs);
    for addr in &args.peers {
        match node.dial(*addr, timeout) {
            Ok(id) => {
                if let Err(e) = node.send(id, HELLO) {
                    warn!("{} hello failed: {}", id, e);
                }
            }
            Err(e) => warn!("Failed to dial {}: {}", addr, e),
        }
    }

    let stats_node = node.clone();
    let stats_secs = args.stats_interval_secs.max(1);
    let stats_handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(stats_secs));
        loop {
            ticker.tick().await;
            let stats = stats_node.stats();
            info!(
                links = stats.link_count,
                accepted = stats.accepted_total,
                rx = stats.bytes_received,
                tx = stats.bytes_sent,
                pending = stats.bytes_pending,
                "Link stats ({:?})",
                stats.cipher_mode
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    stats_handle.abort();
    node.shutdown()?;
    Ok(())
}
