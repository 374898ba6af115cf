//! Facilitator HTTP server.
//!
//! # Usage
//!
//! ```bash
//! # config.toml in the current directory
//! cargo run -p agent402-facilitator --release
//!
//! CONFIG=/path/to/config.toml RUST_LOG=debug cargo run -p agent402-facilitator
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to the TOML configuration (default: `config.toml`)
//! - `HOST` - Overrides the bind address (default: `0.0.0.0`)
//! - `PORT` - Overrides the port (default: `4021`)
//! - `RUST_LOG` - Log filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::SocketAddr;
use std::sync::Arc;

use agent402_facilitator::config::FacilitatorConfig;
use agent402_facilitator::util::ShutdownSignal;
use agent402_facilitator::{build_state, facilitator_router};
use axum::http::Method;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("facilitator failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Another crate in the graph may have installed one already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = FacilitatorConfig::load()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        chains = config.chains.len(),
        "loaded configuration"
    );

    let state = Arc::new(build_state(&config)?);
    let app = facilitator_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let shutdown = ShutdownSignal::install()?;
    let token = shutdown.token();

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("facilitator listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    shutdown.recv().await;

    tracing::info!("facilitator stopped");
    Ok(())
}
