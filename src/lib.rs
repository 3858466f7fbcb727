//! # mpegts-proxy
//!
//! Turns a fixed list of upstream media sources into live MPEG-TS feeds over
//! HTTP. Every client connection gets its own transcoder process whose stdout
//! is streamed as a chunked response.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  GET /route  ┌──────────┐ lookup ┌────────────────┐
//! │ Client  │─────────────▶│  Router  │───────▶│ SourceRegistry │
//! └─────────┘              └──────────┘        └────────────────┘
//!      ▲                        │ 200 + StreamSession
//!      │ chunked video/mp2t     ▼
//! ┌─────────────┐  bytes  ┌──────────────┐ spawn/respawn/kill ┌──────────┐
//! │ SessionBody │◀────────│ Output pipe  │◀───────────────────│ avconv   │
//! └─────────────┘         └──────────────┘    Supervisor      └──────────┘
//! ```
//!
//! - Workers exiting with a transient code are restarted on the same
//!   response; any other exit ends the stream.
//! - Dropping the response body (client disconnect) kills the worker.
//! - Bytes from consecutive workers are concatenated as-is; no MPEG-TS
//!   resynchronisation happens at a restart.

pub mod cli;
pub mod errors;
pub mod logging;
pub mod pipe;
pub mod router;
pub mod session;
pub mod sources;
pub mod supervisor;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::router::AppState;
use crate::sources::SourceRegistry;

/// Load sources, bind, and serve until Ctrl-C.
pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let registry = SourceRegistry::load(&args.sources)
        .with_context(|| format!("loading sources from {}", args.sources.display()))?;

    debug!(routes = ?registry.routes(), "registered sources");

    let policy = args.exit_policy();
    debug!(avconv = %args.avconv, retry_codes = ?policy.retry_codes(), "worker configuration");

    let state = Arc::new(AppState::new(registry, args.avconv.clone(), policy));

    let addr = SocketAddr::new(args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    info!("mpegts-proxy v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    router::serve(listener, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
