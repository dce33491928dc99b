//! Backend address resolution.
//!
//! # Responsibilities
//! - Translate `host:port` into a socket address for each call
//! - Keep a read-mostly table of resolved addresses, swapped atomically
//! - Refresh the table in the background, keeping the last good value on failure
//!
//! # Design Decisions
//! - IP literals never touch the resolver
//! - Staleness is preferred over failure: a failed refresh keeps old addresses
//! - Readers never block: the table lives behind an `ArcSwap`

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::observability::metrics;

/// Resolution failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("'{0}' is not host:port")]
    InvalidAddress(String),

    #[error("no address found for '{0}'")]
    NotFound(String),

    #[error("failed to resolve '{host}': {reason}")]
    Lookup { host: String, reason: String },
}

/// Translates backend addresses to reachable socket addresses.
pub trait Resolve: Send + Sync + std::fmt::Debug {
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<SocketAddr, ResolveError>>;
}

async fn lookup(address: &str) -> Result<Vec<SocketAddr>, ResolveError> {
    if !address.contains(':') {
        return Err(ResolveError::InvalidAddress(address.to_string()));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .map_err(|e| ResolveError::Lookup {
            host: address.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ResolveError::NotFound(address.to_string()));
    }
    Ok(addrs)
}

fn pick(addrs: &[SocketAddr]) -> SocketAddr {
    if addrs.len() == 1 {
        addrs[0]
    } else {
        addrs[fastrand::usize(..addrs.len())]
    }
}

/// Resolves on every call through the system resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<SocketAddr, ResolveError>> {
        Box::pin(async move {
            if let Ok(addr) = address.parse::<SocketAddr>() {
                return Ok(addr);
            }
            lookup(address).await.map(|addrs| pick(&addrs))
        })
    }
}

type AddressTable = HashMap<String, Arc<[SocketAddr]>>;

/// Caching resolver with whole-table refresh.
#[derive(Debug, Default)]
pub struct CachingResolver {
    table: ArcSwap<AddressTable>,
}

impl CachingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hosts currently cached.
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached addresses of `address`, if any.
    pub fn cached(&self, address: &str) -> Option<Arc<[SocketAddr]>> {
        self.table.load().get(address).cloned()
    }

    fn publish(&self, address: &str, addrs: Arc<[SocketAddr]>) {
        self.table.rcu(|current| {
            let mut next = AddressTable::clone(current);
            next.insert(address.to_string(), addrs.clone());
            next
        });
    }

    /// Re-resolve every known host and swap in the new table.
    ///
    /// Hosts that fail to resolve keep their previous addresses. Returns the
    /// number of failed hosts.
    pub async fn refresh(&self) -> usize {
        let current = self.table.load_full();
        let mut next = AddressTable::with_capacity(current.len());
        let mut failures = 0;

        for (host, old) in current.iter() {
            match lookup(host).await {
                Ok(addrs) => {
                    next.insert(host.clone(), addrs.into());
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(host = %host, error = %e, "Resolver refresh failed, keeping last known addresses");
                    next.insert(host.clone(), old.clone());
                }
            }
        }

        // Hosts first resolved while the refresh was running.
        self.table.rcu(|latest| {
            let mut merged = next.clone();
            for (host, addrs) in latest.iter() {
                merged.entry(host.clone()).or_insert_with(|| addrs.clone());
            }
            merged
        });

        if failures > 0 {
            metrics::record_resolver_failures(failures);
        }
        failures
    }

    /// Refresh loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Resolver refresh starting");

        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let failures = self.refresh().await;
                    tracing::debug!(hosts = self.len(), failures, "Resolver table refreshed");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Resolver received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

impl Resolve for CachingResolver {
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<SocketAddr, ResolveError>> {
        Box::pin(async move {
            if let Ok(addr) = address.parse::<SocketAddr>() {
                return Ok(addr);
            }
            if let Some(addrs) = self.cached(address) {
                return Ok(pick(&addrs));
            }

            let addrs: Arc<[SocketAddr]> = lookup(address).await?.into();
            let addr = pick(&addrs);
            self.publish(address, addrs);
            Ok(addr)
        })
    }
}
