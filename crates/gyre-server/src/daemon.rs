//! Daemon wiring: seed, store, chain client, coordinator, listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use gyre_bitcoind::BitcoindClient;
use gyre_coordinator::{connection, Coordinator, Event, Store};
use gyre_core::seed::{derive_seed, load_or_create_mnemonic, parse_mnemonic};
use gyre_core::KeyManager;

use crate::config::ServerConfig;

/// Run the coordinator. Blocks until a shutdown signal drains it.
pub async fn run(config: ServerConfig) -> Result<()> {
    let network = config.network()?;
    log::info!("Gyre coordinator '{}' starting…", config.coordinator.name);
    log::info!("  Network:   {}", network);
    log::info!("  Listen:    {}", config.coordinator.listen);
    log::info!("  Bitcoind:  {}", config.bitcoind.rpc_url);
    log::info!("  Data dir:  {}", config.coordinator_dir().display());
    log::info!(
        "  Round:     {} sat mix, {} sat fee, {}s interval",
        config.round.amount,
        config.round.coordinator_fee,
        config.round.interval_secs
    );

    // GYRE_MNEMONIC lets deployments inject the seed without a file.
    let mnemonic = match std::env::var("GYRE_MNEMONIC") {
        Ok(words) => parse_mnemonic(&words).context("GYRE_MNEMONIC is not a valid mnemonic")?,
        Err(_) => load_or_create_mnemonic(&config.seed_path())
            .with_context(|| format!("Failed to load seed from {}", config.seed_path().display()))?,
    };
    let seed = derive_seed(&mnemonic, "");
    let keys = KeyManager::new(&seed, network).context("Key derivation failed")?;

    let store = Store::open(&config.db_path())
        .with_context(|| format!("Failed to open database at {}", config.db_path().display()))?;

    let chain = Arc::new(BitcoindClient::new(
        &config.bitcoind.rpc_url,
        &config.bitcoind.rpc_user,
        &config.bitcoind.rpc_password,
    ));

    let (coordinator, events) =
        Coordinator::new(config.coordinator_config()?, store, keys, chain)
            .await
            .context("Failed to start the coordinator")?;

    let listener = TcpListener::bind(config.listen_addr()?)
        .await
        .with_context(|| format!("Failed to bind {}", config.coordinator.listen))?;
    log::info!("Listening on {}", config.coordinator.listen);
    tokio::spawn(connection::serve(listener, events.clone()));

    // Ctrl-C turns into a Stop event so the coordinator flushes the
    // current round before exiting.
    let shutdown = events.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received shutdown signal");
            let _ = shutdown.send(Event::Stop);
        }
    });

    coordinator.run().await;
    log::info!("Coordinator stopped.");
    Ok(())
}
