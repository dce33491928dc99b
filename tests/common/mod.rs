//! Shared utilities for integration tests.
#![allow(dead_code)]

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use metrics_gateway::cache::{CachePolicy, ResultCache};
use metrics_gateway::dispatch::transport::{BackendRequest, BackendTransport};
use metrics_gateway::dispatch::{CancellationPolicy, Dispatcher};
use metrics_gateway::error::CallError;
use metrics_gateway::group::backend::Backend;
use metrics_gateway::group::pool::GroupRegistry;
use metrics_gateway::group::{BackendGroup, SelectionPolicy};
use metrics_gateway::health::{HealthPolicy, HealthTracker};
use metrics_gateway::resolver::SystemResolver;
use metrics_gateway::response::{Payload, Series};
use metrics_gateway::Gateway;

/// Canned answer of one scripted backend.
#[derive(Debug, Clone)]
pub struct Script {
    pub delay: Duration,
    pub result: Result<Payload, CallError>,
}

impl Script {
    pub fn paths(paths: &[&str]) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(Payload::Paths(paths.iter().map(|p| p.to_string()).collect())),
        }
    }

    /// One series per `(name, start, step, values)`.
    pub fn series(series: &[(&str, i64, u32, Vec<Option<f64>>)]) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(Payload::Series(
                series
                    .iter()
                    .map(|(name, start, step, values)| Series {
                        name: name.to_string(),
                        start: *start,
                        step: *step,
                        values: values.clone(),
                    })
                    .collect(),
            )),
        }
    }

    pub fn fail(error: CallError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

/// In-process transport answering by backend name.
///
/// Clones share scripts and counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: DashMap<String, Script>,
    calls: DashMap<String, usize>,
    completed: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, backend: &str, script: Script) {
        self.inner.scripts.insert(backend.to_string(), script);
    }

    /// Calls started against `backend`.
    pub fn calls(&self, backend: &str) -> usize {
        self.inner.calls.get(backend).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.inner.calls.iter().map(|c| *c.value()).sum()
    }

    /// Calls that ran to the end of their delay.
    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::SeqCst)
    }
}

impl BackendTransport for ScriptedTransport {
    fn call(
        &self,
        backend: &Backend,
        _addr: SocketAddr,
        _request: &BackendRequest,
    ) -> BoxFuture<'static, Result<Payload, CallError>> {
        let name = backend.name().to_string();
        *self.inner.calls.entry(name.clone()).or_insert(0) += 1;
        let script = self.inner.scripts.get(&name).map(|s| s.clone());
        let state = self.inner.clone();

        Box::pin(async move {
            let script = script.unwrap_or_else(|| Script::fail(CallError::Unreachable(name)));
            tokio::time::sleep(script.delay).await;
            state.completed.fetch_add(1, Ordering::SeqCst);
            script.result
        })
    }
}

/// A group whose backends are named `names` and never need DNS.
pub fn group(name: &str, policy: SelectionPolicy, names: &[&str], timeout_ms: u64) -> BackendGroup {
    let backends = names
        .iter()
        .enumerate()
        .map(|(i, b)| Arc::new(Backend::new(*b, format!("127.0.0.1:{}", 20_000 + i), name)))
        .collect();
    BackendGroup::new(name, backends, policy, Duration::from_millis(timeout_ms), 16)
}

pub fn health_policy(failure_threshold: u32, cooldown_ms: u64) -> HealthPolicy {
    HealthPolicy {
        failure_threshold,
        cooldown: Duration::from_millis(cooldown_ms),
        ewma_alpha: 0.3,
    }
}

pub fn cache_policy(ttl_ms: u64, cancellation: CancellationPolicy) -> CachePolicy {
    CachePolicy {
        ttl: Duration::from_millis(ttl_ms),
        partial_ttl: Duration::ZERO,
        cancellation,
    }
}

/// Gateway over scripted backends.
pub fn gateway(
    groups: Vec<BackendGroup>,
    transport: &ScriptedTransport,
    health: HealthPolicy,
    cache: CachePolicy,
) -> Gateway {
    let dispatcher = Dispatcher::new(
        Arc::new(transport.clone()),
        Arc::new(SystemResolver),
        HealthTracker::new(health),
    );
    Gateway::new(GroupRegistry::from_groups(groups), dispatcher, ResultCache::new(cache), 60)
}

pub fn deadline_in(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

/// Start a mock HTTP backend on an ephemeral port.
///
/// `handler` receives the request target (path and query) and returns the
/// status and body.
pub async fn start_programmable_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let Some(target) = read_request_target(&mut socket).await else {
                            return;
                        };
                        let (status, body) = handler(target).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a mock backend that always answers `status` with `body`.
pub async fn start_mock_backend(status: u16, body: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { (status, body.to_string()) }).await
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_request_target(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next()?;
    request_line.split_whitespace().nth(1).map(str::to_string)
}

/// Graphite render JSON for one series.
pub fn render_body(name: &str, points: &[(Option<f64>, i64)]) -> String {
    let datapoints: Vec<serde_json::Value> = points
        .iter()
        .map(|(v, ts)| serde_json::json!([v, ts]))
        .collect();
    serde_json::json!([{ "target": name, "datapoints": datapoints }]).to_string()
}

/// Graphite find JSON.
pub fn find_body(paths: &[&str]) -> String {
    let entries: Vec<serde_json::Value> = paths
        .iter()
        .map(|p| serde_json::json!({ "path": p, "is_leaf": true }))
        .collect();
    serde_json::Value::Array(entries).to_string()
}
