//! The mailway daemon: one process running the inbound SMTP listener
//! and the outbound delivery engine over a shared spool.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use mailway_common::config::Config;
use mailway_common::logging;
use mailway_common::relay::RelayTable;
use mailway_delivery::DeliveryEngine;
use mailway_smtp::Server;
use mailway_spool::Spool;

/// A minimal store-and-forward mail transfer agent.
#[derive(Parser, Debug)]
#[command(name = "mailway", version, about)]
struct Cli {
    /// Path to the configuration file; created with defaults when
    /// missing.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_create(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(config.verbose);
    info!(
        "SMTP@{}, DBG={}, CFG={}",
        config.listen_addr(),
        config.verbose,
        cli.config.display()
    );

    let spool = Spool::new(&config.spool);
    spool.ensure_layout().await.context("preparing spool")?;

    let socket: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("binding {}", config.listen_addr()))?;
    let relay = RelayTable::new(&config.routing);
    let engine = DeliveryEngine::new(&config, spool.clone()).context("starting delivery")?;
    let server = Server::new(socket, config.max_sessions, spool, relay);

    tokio::select! {
        outcome = server.serve() => outcome.context("SMTP listener failed")?,
        () = engine.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("Shutdown signal received, stopping");
        }
    }
    Ok(())
}
