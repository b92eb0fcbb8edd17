//! Process entrypoint (A5, `SPEC_FULL.md` §4.5): parses configuration,
//! initializes tracing, constructs the engine and its collaborators,
//! serves the inbound API, and awaits shutdown.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pubtxmgr::config::{load_config, Cli};
use pubtxmgr::engine::Engine;
use pubtxmgr::fueling::{CompletedNonceCache, FuelingManager};
use pubtxmgr::gas_oracle::GasPriceOracle;
use pubtxmgr::keystore::LocalKeyStore;
use pubtxmgr::ledger::EthersLedger;
use pubtxmgr::shutdown::Shutdown;
use pubtxmgr::store::postgres::PgStore;
use pubtxmgr::store::retry::RetryingStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config(cli.config.as_deref())?;

    let shutdown = Shutdown::new(Duration::from_secs(5));
    let store = Arc::new(RetryingStore::new(
        PgStore::connect(&config.database).await?,
        config.retry,
        shutdown.clone(),
    ));

    let ledger = Arc::new(EthersLedger::new(&config.ledger.rpc_url, config.ledger.legacy)?);
    let keystore = Arc::new(LocalKeyStore::new());
    let gas_oracle = Arc::new(GasPriceOracle::new(ledger.clone(), config.orchestrator.gas_price_ttl));
    let fueling = Arc::new(FuelingManager::new(store.clone(), config.fueling.clone()));
    let completed_nonces = Arc::new(CompletedNonceCache::with_capacity(config.transaction_cache.capacity));
    let confirmation_blocks = config.orchestrator.confirmation_blocks;

    let engine = Arc::new(Engine::new(
        store.clone(),
        ledger.clone(),
        keystore,
        gas_oracle,
        fueling,
        completed_nonces.clone(),
        config.engine,
        config.orchestrator,
        config.ledger.chain_id,
        config.ledger.legacy,
        shutdown.clone(),
    ));

    let confirmation_tracker = Arc::new(pubtxmgr::confirmation::ConfirmationTracker::new(
        store.clone(),
        ledger,
        completed_nonces.clone(),
        confirmation_blocks,
    ));

    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });
    let tracker_handle = tokio::spawn({
        let tracker = confirmation_tracker.clone();
        let shutdown = shutdown.clone();
        async move { tracker.run(shutdown).await }
    });

    let api = pubtxmgr::api::router(store);
    let listener = tokio::net::TcpListener::bind(config.server.host).await?;
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, api)
            .with_graceful_shutdown(async move { server_shutdown.await_shutdown_begin().await })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
        () = shutdown.await_shutdown_begin() => {}
    }
    shutdown.shutdown();
    shutdown.wait_with_grace().await;

    let _ = engine_handle.await;
    let _ = tracker_handle.await;
    let _ = server_handle.await;

    Ok(())
}
