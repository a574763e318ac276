//! dimhub HTTP server
//!
//! # Endpoints
//!
//! - `POST /stats/:id` - submit counters/increments/gauges/members with dims
//! - `GET /stats/:dim` - per-dimension rollups (`/stats/` for all dims)
//! - `GET /stream/:dim/:key/:statType/:statName` - WebSocket rollup stream
//!
//! # Configuration
//!
//! Environment variables: `PORT`, `REDIS_ADDR`, `REDIS_PASS`,
//! `ARCHIVED_DIMS` (e.g. `country,10 fallback,10`).
//!
//! # Example Usage
//!
//! ```bash
//! REDIS_ADDR=localhost:6379 PORT=9000 ./server
//!
//! curl --data-binary '{
//!     "dims": {"country": "es", "user": "bob"},
//!     "counters": {"counterA": 50},
//!     "increments": {"counterB": 500},
//!     "gauges": {"gaugeA": 5000},
//!     "members": {"gaugeB": "item1"}
//!   }' "http://localhost:9000/stats/myid1"
//!
//! curl -i "http://localhost:9000/stats/country"
//! ```

use dimhub::archive::{Archiver, NullWarehouse};
use dimhub::cache::SnapshotCache;
use dimhub::http::{router, AppState};
use dimhub::store::{RedisStore, Store};
use dimhub::{HubConfig, StatsHub};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match HubConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // Inability to dial or authenticate to the store is fatal at startup;
    // everything after this point logs and retries instead.
    let store = match RedisStore::connect(config.store.clone()).await {
        Ok(store) => Arc::new(store) as Arc<dyn Store>,
        Err(e) => {
            error!(error = %e, "unable to connect to store");
            return ExitCode::FAILURE;
        }
    };

    let hub = Arc::new(StatsHub::new(store, config.periods));
    let stream = dimhub::stream::spawn(hub.clone(), config.streaming.clone());

    if !config.archived_dims.is_empty() {
        Archiver::new(hub.clone(), Arc::new(NullWarehouse))
            .spawn(config.archived_dims.clone());
    } else {
        info!("no archived dims configured, archiver disabled");
    }

    let state = Arc::new(AppState {
        hub,
        stream,
        country_cache: SnapshotCache::new(),
        cache_ttl: config.cache_ttl,
    });
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "unable to bind");
            return ExitCode::FAILURE;
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
        return ExitCode::FAILURE;
    }

    info!("shut down cleanly");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_err() {
        error!("unable to install shutdown signal handler");
        // Fall through and let the future resolve so the server stops
    }
    info!("shutdown signal received");
}
