//! Backend wire protocol.
//!
//! # Responsibilities
//! - Turn a query into a backend HTTP request
//! - Decode graphite-style JSON bodies into [`Payload`]s
//! - Classify failures into [`CallError`]s
//!
//! # Wire Format
//! ```text
//! find:   GET /metrics/find/?query=<target>&format=json
//!         → [{"path": "a.b.c", "is_leaf": true}, ...]
//! render: GET /render/?target=<t>&target=<t>&from=<s>&until=<s>&format=json
//!         → [{"target": "a.b.c", "datapoints": [[1.0, 60], [null, 120]]}, ...]
//! ```
//! A 404 is an empty answer, not a failure.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures_util::future::{try_join_all, BoxFuture};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use url::Url;

use crate::error::CallError;
use crate::group::backend::Backend;
use crate::query::{Query, QueryKind, TimeRange};
use crate::response::{Payload, Series};

/// Step used when neither the query nor the datapoints reveal one.
pub const DEFAULT_STEP: u32 = 60;

/// What is sent to every backend for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub kind: QueryKind,
    pub targets: Vec<String>,
    pub range: Option<TimeRange>,
    pub step: Option<u32>,
    /// Longest series accepted from a backend.
    pub max_points: usize,
}

impl From<&Query> for BackendRequest {
    fn from(query: &Query) -> Self {
        Self {
            kind: query.kind(),
            targets: query.targets().to_vec(),
            range: query.range(),
            step: query.step(),
            max_points: query.max_points(),
        }
    }
}

impl BackendRequest {
    fn empty_payload(&self) -> Payload {
        match self.kind {
            QueryKind::Find => Payload::Paths(Vec::new()),
            QueryKind::Render => Payload::Series(Vec::new()),
        }
    }
}

/// Performs one call against one backend.
///
/// Implementations do not enforce timeouts; the dispatcher bounds every call.
pub trait BackendTransport: Send + Sync + fmt::Debug {
    fn call(
        &self,
        backend: &Backend,
        addr: SocketAddr,
        request: &BackendRequest,
    ) -> BoxFuture<'static, Result<Payload, CallError>>;
}

/// HTTP/JSON transport over a pooled hyper client.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Body>,
    max_response_bytes: usize,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("max_response_bytes", &self.max_response_bytes)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(max_response_bytes: usize) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            max_response_bytes,
        }
    }
}

impl BackendTransport for HttpTransport {
    fn call(
        &self,
        backend: &Backend,
        addr: SocketAddr,
        request: &BackendRequest,
    ) -> BoxFuture<'static, Result<Payload, CallError>> {
        let client = self.client.clone();
        let limit = self.max_response_bytes;
        let host = backend.address().to_string();
        let request = request.clone();

        Box::pin(async move {
            let urls = request_urls(addr, &request)?;
            let payloads = try_join_all(
                urls.into_iter()
                    .map(|url| fetch(&client, url, &host, limit, &request)),
            )
            .await?;

            Ok(payloads
                .into_iter()
                .reduce(concat)
                .unwrap_or_else(|| request.empty_payload()))
        })
    }
}

async fn fetch(
    client: &Client<HttpConnector, Body>,
    url: Url,
    host: &str,
    limit: usize,
    request: &BackendRequest,
) -> Result<Payload, CallError> {
    let http_request = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header(header::HOST, host)
        .header(header::ACCEPT, "application/json")
        .header(header::USER_AGENT, concat!("metrics-gateway/", env!("CARGO_PKG_VERSION")))
        .body(Body::empty())
        .map_err(|e| CallError::Malformed(format!("failed to build request: {}", e)))?;

    let response = client
        .request(http_request)
        .await
        .map_err(|e| CallError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(request.empty_payload());
    }
    if !status.is_success() {
        return Err(CallError::Status(status.as_u16()));
    }

    let body = axum::body::to_bytes(Body::new(response.into_body()), limit)
        .await
        .map_err(|e| CallError::Malformed(format!("failed to read body: {}", e)))?;

    decode(request, &body)
}

fn concat(a: Payload, b: Payload) -> Payload {
    match (a, b) {
        (Payload::Paths(mut a), Payload::Paths(b)) => {
            a.extend(b);
            Payload::Paths(a)
        }
        (Payload::Series(mut a), Payload::Series(b)) => {
            a.extend(b);
            Payload::Series(a)
        }
        (a, _) => a,
    }
}

/// Build the backend URLs for `request`: one per pattern for find, one for render.
pub fn request_urls(addr: SocketAddr, request: &BackendRequest) -> Result<Vec<Url>, CallError> {
    let base = |path: &str| {
        Url::parse(&format!("http://{}{}", addr, path))
            .map_err(|e| CallError::Unreachable(format!("invalid backend url: {}", e)))
    };

    match request.kind {
        QueryKind::Find => request
            .targets
            .iter()
            .map(|target| {
                let mut url = base("/metrics/find/")?;
                url.query_pairs_mut()
                    .append_pair("query", target)
                    .append_pair("format", "json");
                Ok(url)
            })
            .collect(),
        QueryKind::Render => {
            let mut url = base("/render/")?;
            {
                let mut pairs = url.query_pairs_mut();
                for target in &request.targets {
                    pairs.append_pair("target", target);
                }
                if let Some(range) = request.range {
                    pairs.append_pair("from", &range.from.to_string());
                    pairs.append_pair("until", &range.until.to_string());
                }
                pairs.append_pair("format", "json");
            }
            Ok(vec![url])
        }
    }
}

#[derive(Debug, Deserialize)]
struct FindEntry {
    path: String,
}

#[derive(Debug, Deserialize)]
struct RenderEntry {
    target: String,
    datapoints: Vec<(Option<f64>, i64)>,
}

/// Decode a backend body according to the request kind.
pub fn decode(request: &BackendRequest, body: &[u8]) -> Result<Payload, CallError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(request.empty_payload());
    }

    match request.kind {
        QueryKind::Find => {
            let entries: Vec<FindEntry> = serde_json::from_slice(body)
                .map_err(|e| CallError::Malformed(e.to_string()))?;
            Ok(Payload::Paths(entries.into_iter().map(|e| e.path).collect()))
        }
        QueryKind::Render => {
            let entries: Vec<RenderEntry> = serde_json::from_slice(body)
                .map_err(|e| CallError::Malformed(e.to_string()))?;
            let series = entries
                .into_iter()
                .map(|e| to_series(e.target, e.datapoints, request.step, request.max_points))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Payload::Series(series))
        }
    }
}

/// Lay datapoints onto a fixed-step grid starting at the first timestamp.
///
/// A grid longer than `max_points` is malformed.
fn to_series(
    name: String,
    mut datapoints: Vec<(Option<f64>, i64)>,
    query_step: Option<u32>,
    max_points: usize,
) -> Result<Series, CallError> {
    datapoints.sort_by_key(|(_, ts)| *ts);

    let step = match datapoints.as_slice() {
        [(_, a), (_, b), ..] if b > a => u32::try_from(b.abs_diff(*a))
            .map_err(|_| CallError::Malformed(format!("step too large in '{}'", name)))?,
        _ => query_step.unwrap_or(DEFAULT_STEP).max(1),
    };

    let Some(&(_, start)) = datapoints.first() else {
        return Ok(Series {
            name,
            start: 0,
            step,
            values: Vec::new(),
        });
    };

    let step_secs = u64::from(step);
    let last = datapoints.last().map(|(_, ts)| *ts).unwrap_or(start);
    let len = (last.abs_diff(start) / step_secs)
        .checked_add(1)
        .and_then(|len| usize::try_from(len).ok())
        .filter(|len| *len <= max_points)
        .ok_or_else(|| {
            CallError::Malformed(format!("'{}' spans more than {} points", name, max_points))
        })?;
    let mut values = vec![None; len];

    for (value, ts) in datapoints {
        let offset = ts.abs_diff(start);
        if offset % step_secs != 0 {
            continue;
        }
        // offset <= last - start, so the slot is below len.
        let slot = (offset / step_secs) as usize;
        if values[slot].is_none() {
            values[slot] = value;
        }
    }

    Ok(Series {
        name,
        start,
        step,
        values,
    })
}
