//! Allocator HTTP entrypoint.
//!
//! Boots the allocation engine and serves the allocator API over axum:
//!
//! - `GET /suggested-nonce/:chainId/:account` — fresh sponsor-bound nonce
//! - `POST /compact` — validate, co-sign, and record a compact
//! - `POST /compact/is-allocatable` — side-effect-free viability check
//! - `GET /compacts/:account`, `GET /compact/:chainId/:claimHash` — lookups
//! - `GET /balance/...`, `GET /balances/:account` — lock balances
//!
//! Environment is loaded from `.env` at startup; see [`config`] for the
//! variables. The supported-chain set is fetched from the indexer once at
//! boot; a dead indexer is a fatal startup error, not a degraded mode.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use compact_allocator_rs::allocation::AllocationEngine;
use compact_allocator_rs::chains::ChainRegistry;
use compact_allocator_rs::config::Config;
use compact_allocator_rs::handlers::{self, AppState};
use compact_allocator_rs::indexer::HttpIndexerClient;
use compact_allocator_rs::sig_down::SigDown;
use compact_allocator_rs::signer::AllocatorSigner;
use compact_allocator_rs::store::MemoryStore;
use compact_allocator_rs::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    telemetry::init();

    let config = Config::from_env()?;
    let signer = Arc::new(AllocatorSigner::new(
        config.private_key(),
        config.allocator_address(),
        config.skip_signing_verification(),
    )?);
    tracing::info!(allocator = %signer.address(), "allocator key loaded");

    let indexer = Arc::new(HttpIndexerClient::new(
        config.indexer_url().clone(),
        config.indexer_timeout(),
    )?);
    let store = Arc::new(MemoryStore::new());
    let chains = Arc::new(ChainRegistry::new(signer.address()));
    chains.refresh(indexer.as_ref()).await?;

    let engine = AllocationEngine::new(
        Arc::clone(&indexer),
        Arc::clone(&store),
        Arc::clone(&chains),
        signer,
    );
    let state = Arc::new(AppState {
        engine,
        store,
        indexer,
    });

    let app = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();
    let graceful_shutdown = async move { cancellation_token.cancelled().await };
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown)
        .await?;

    Ok(())
}
