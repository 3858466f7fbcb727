//! HTTP surface of the proxy.
//!
//! Every request, whatever its method, is resolved against the source
//! registry by its exact request target:
//!
//! - unknown target: `404`, `text/plain`, body `404 Not Found\n`
//! - known target: `200`, `video/mp2t`, chunked body fed by a fresh worker
//! - worker binary cannot be started: `502`, `text/plain`

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::session::StreamSession;
use crate::sources::SourceRegistry;
use crate::worker::ExitPolicy;

// ============================================================================
// App State
// ============================================================================

/// State shared by all request handlers. Read-only apart from the session
/// counter.
pub struct AppState {
    registry: SourceRegistry,   // Immutable after startup
    avconv: String,             // Transcoder binary
    policy: ExitPolicy,         // Exit code -> respawn/abort
    next_session: AtomicU64,    // Monotonic session id
}

impl AppState {
    pub fn new(registry: SourceRegistry, avconv: impl Into<String>, policy: ExitPolicy) -> Self {
        Self {
            registry,
            avconv: avconv.into(),
            policy,
            next_session: AtomicU64::new(1),
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }
}

// ============================================================================
// Stream Endpoint
// ============================================================================

async fn stream_source(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let uri = request.uri();
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
        .to_string();

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    debug!("Got request for \"{}\" from {}", target, remote);

    let source = match state.registry.resolve(&target) {
        Ok(source) => source,
        Err(e) => {
            info!("Unknown source \"{}\" requested", target);
            return e.into_response();
        }
    };

    let id = state.next_session_id();
    let started = StreamSession::start(id, source, &state.avconv, state.policy.clone());
    let (session, body) = match started {
        Ok(started) => started,
        Err(e) => {
            error!(session = id, route = %target, error = %e, "could not start worker");
            return e.into_response();
        }
    };

    info!(
        session = session.id(),
        route = %session.source().route,
        provider = %session.source().provider,
        name = %session.source().name,
        "streaming to {}",
        remote
    );

    // Dropping the session detaches its supervisor task; the body keeps the
    // stop handle for disconnects.
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::TRANSFER_ENCODING, "chunked"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

// ============================================================================
// Router / Server
// ============================================================================

/// Build the axum router. All paths fall through to the stream handler.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(stream_source)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Streams never finish on their own, so open connections are not drained:
/// they are dropped with the runtime, which kills their workers.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let server = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        result = server.into_future() => result,
        _ = shutdown => Ok(()),
    }
}
