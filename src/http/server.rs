//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, request timeout, request ID, CORS, gzip)
//! - Serve one router on any number of listeners until shutdown

use axum::{http::HeaderName, routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin;
use crate::config::DispatchConfig;
use crate::gateway::Gateway;
use crate::http::handlers;

/// Request ID header name.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Slack added to the largest query deadline before the HTTP layer gives up.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub dispatch: DispatchConfig,
    pub started: Instant,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, dispatch: DispatchConfig) -> Self {
        Self {
            gateway,
            dispatch,
            started: Instant::now(),
        }
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Query API, plus `/debug/*` when `with_debug` is set.
    pub fn new(state: AppState, with_debug: bool) -> Self {
        let router = Self::build_router(state, with_debug);
        Self { router }
    }

    /// `/debug/*` only, for a dedicated debug listener.
    pub fn debug_only(state: AppState) -> Self {
        let request_timeout = request_timeout(&state);
        Self {
            router: with_layers(admin::debug_router().with_state(state), request_timeout),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState, with_debug: bool) -> Router {
        let request_timeout = request_timeout(&state);

        let mut router = Router::new()
            .route("/metrics/find", get(handlers::find))
            .route("/metrics/find/", get(handlers::find))
            .route("/render", get(handlers::render))
            .route("/render/", get(handlers::render))
            .route("/health", get(handlers::health));

        if with_debug {
            router = router.merge(admin::debug_router());
        }

        with_layers(router.with_state(state), request_timeout)
    }

    /// Clone of the router, for serving on several listeners.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server on `listener` until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        serve(self.router, listener, shutdown).await
    }
}

fn request_timeout(state: &AppState) -> Duration {
    Duration::from_millis(state.dispatch.max_timeout_ms) + TIMEOUT_GRACE
}

/// Request id, tracing, CORS, compression and the request timeout.
#[allow(deprecated)]
fn with_layers(router: Router, request_timeout: Duration) -> Router {
    let request_id = HeaderName::from_static(X_REQUEST_ID);

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::new(request_id))
            .layer(CorsLayer::permissive())
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::new(request_timeout)),
    )
}

/// Serve `router` on `listener` with graceful shutdown.
pub async fn serve<F>(router: Router, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!(address = %addr, "HTTP server stopped");
    Ok(())
}
