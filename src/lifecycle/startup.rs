//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order
//! - Start background tasks (resolver refresh, cache sweep, metrics)
//! - Bind every listener, then begin accepting traffic
//! - Wait for shutdown and drain
//!
//! # Design Decisions
//! - Fail fast: any bind error is fatal before traffic is accepted
//! - Listeners start last (traffic only when ready)
//! - One listener failing stops the others

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::config::GatewayConfig;
use crate::dispatch::transport::HttpTransport;
use crate::gateway::Gateway;
use crate::http::server::{serve, AppState, HttpServer};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resolver::{CachingResolver, Resolve, SystemResolver};

/// Fatal startup or serving failure.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Build the resolver and gateway, spawning their background tasks.
pub fn build_gateway(config: &GatewayConfig, shutdown: &Shutdown) -> Arc<Gateway> {
    let resolver: Arc<dyn Resolve> = if config.resolver.caching {
        let resolver = Arc::new(CachingResolver::new());
        let interval = Duration::from_millis(config.resolver.refresh_interval_ms);
        tokio::spawn(resolver.clone().run(interval, shutdown.subscribe()));
        resolver
    } else {
        tracing::info!("Resolver caching disabled, resolving on every call");
        Arc::new(SystemResolver)
    };

    let transport = Arc::new(HttpTransport::new(config.dispatch.max_response_bytes));
    let gateway = Arc::new(Gateway::from_config(config, transport, resolver));

    for backend in gateway.groups().all_backends() {
        metrics::record_backend_health(backend.name(), backend.health().state());
    }

    if config.cache.sweep_interval_ms > 0 {
        let sweeper = gateway.cache().clone();
        let interval = Duration::from_millis(config.cache.sweep_interval_ms);
        tokio::spawn(sweeper.run_sweeper(interval, shutdown.subscribe()));
    }

    tracing::info!(
        groups = config.groups.len(),
        backends = gateway.groups().all_backends().len(),
        cancellation = config.dispatch.cancellation.as_str(),
        cache_ttl_ms = config.cache.ttl_ms,
        "Gateway initialized"
    );

    gateway
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| StartupError::Bind {
            address: address.to_string(),
            source,
        })
}

/// Run the gateway until `shutdown` is triggered.
pub async fn run(config: GatewayConfig, shutdown: Arc<Shutdown>) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let gateway = build_gateway(&config, &shutdown);

    let mut listeners = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        listeners.push(bind(&listener.address).await?);
    }

    let separate_debug = config.debug.enabled && !config.debug.listen.is_empty();
    let debug_listener = if separate_debug {
        Some(bind(&config.debug.listen).await?)
    } else {
        None
    };

    let state = AppState::new(gateway.clone(), config.dispatch.clone());
    let server = HttpServer::new(state.clone(), config.debug.enabled && !separate_debug);

    let mut servers = JoinSet::new();
    for listener in listeners {
        servers.spawn(serve(server.router(), listener, shutdown.wait()));
    }
    if let Some(listener) = debug_listener {
        servers.spawn(HttpServer::debug_only(state).run(listener, shutdown.wait()));
    }

    tracing::info!(listeners = servers.len(), "Gateway ready");

    let mut result = Ok(());
    while let Some(joined) = servers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Listener failed, shutting down");
                shutdown.trigger();
                result = Err(StartupError::Serve(e));
            }
            Err(e) => {
                tracing::error!(error = %e, "Listener task panicked, shutting down");
                shutdown.trigger();
            }
        }
    }

    gateway.cache().cancel_all();
    result
}
