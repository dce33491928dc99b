//! Query handlers.
//!
//! # Responsibilities
//! - Parse graphite-style query strings (repeated `target` / `query` keys)
//! - Build a [`Query`] with a deadline from `timeout` or the configured default
//! - Tie the query's cancellation to the lifetime of the request
//! - Map results and errors to HTTP responses

use axum::{
    extract::{RawQuery, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::http::server::AppState;
use crate::query::{Query, TimeRange};
use crate::response::{MergedResult, Series};

/// Header carrying the completeness of a result.
pub const X_GATEWAY_COMPLETENESS: &str = "x-gateway-completeness";

/// Status used when the client went away.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Decoded query string.
#[derive(Debug, Default)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn parse(raw: Option<&str>) -> Self {
        let pairs = raw
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self { pairs }
    }

    /// Every value of `key`, in order.
    pub fn all(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// First value of `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value of `key` parsed as a number.
    pub fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, QueryError> {
        match self.first(key) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| QueryError::InvalidQuery(format!("'{}' is not a valid {}", raw, key))),
        }
    }

    fn required<T: std::str::FromStr>(&self, key: &str) -> Result<T, QueryError> {
        self.number(key)?
            .ok_or_else(|| QueryError::InvalidQuery(format!("missing '{}'", key)))
    }
}

#[derive(Debug, Serialize)]
struct FindBody<'a> {
    paths: &'a [String],
    complete: bool,
}

/// `GET /metrics/find`
pub async fn find(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let params = Params::parse(raw.as_deref());
    let query = match build_find(&state, &params) {
        Ok(query) => query,
        Err(e) => return error_response(&e),
    };

    match run(&state, query).await {
        Ok(result) => {
            let body = FindBody {
                paths: result.paths().unwrap_or_default(),
                complete: result.completeness.is_complete(),
            };
            with_completeness(Json(body).into_response(), &result)
        }
        Err(e) => error_response(&e),
    }
}

/// `GET /render`
pub async fn render(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Response {
    let params = Params::parse(raw.as_deref());
    let query = match build_render(&state, &params) {
        Ok(query) => query,
        Err(e) => return error_response(&e),
    };

    match run(&state, query).await {
        Ok(result) => {
            let series: &[Series] = result.series().unwrap_or_default();
            with_completeness(Json(series).into_response(), &result)
        }
        Err(e) => error_response(&e),
    }
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}

fn deadline(state: &AppState, params: &Params) -> Result<Instant, QueryError> {
    let timeout = state.dispatch.query_timeout(params.number("timeout")?);
    Ok(Instant::now() + timeout)
}

fn build_find(state: &AppState, params: &Params) -> Result<Query, QueryError> {
    Query::find(params.all("query"), deadline(state, params)?)
}

fn build_render(state: &AppState, params: &Params) -> Result<Query, QueryError> {
    let range = TimeRange::new(params.required("from")?, params.required("until")?)?;
    let query = Query::render(params.all("target"), range, deadline(state, params)?)?
        .with_max_points(state.dispatch.max_points)?;
    match params.number::<u32>("step")? {
        Some(step) => query.with_step(step),
        None => Ok(query),
    }
}

/// Run `query`, cancelling it if this future is dropped.
async fn run(state: &AppState, query: Query) -> Result<std::sync::Arc<MergedResult>, QueryError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let result = state.gateway.query(query, &cancel).await;
    guard.disarm();
    result
}

fn with_completeness(mut response: Response, result: &MergedResult) -> Response {
    response.headers_mut().insert(
        X_GATEWAY_COMPLETENESS,
        HeaderValue::from_static(result.completeness.as_str()),
    );
    response
}

/// HTTP status of a query failure.
pub fn status_of(error: &QueryError) -> StatusCode {
    match error {
        QueryError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        QueryError::AllBackendsFailed { .. } => StatusCode::BAD_GATEWAY,
        QueryError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        QueryError::ClientCanceled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::REQUEST_TIMEOUT)
        }
    }
}

fn error_response(error: &QueryError) -> Response {
    (status_of(error), error.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_keep_repeated_keys() {
        let params = Params::parse(Some("target=a.b&target=c%2A&from=10&until=20"));
        assert_eq!(params.all("target"), vec!["a.b", "c*"]);
        assert_eq!(params.number::<i64>("from").unwrap(), Some(10));
        assert_eq!(params.number::<u64>("timeout").unwrap(), None);
    }

    #[test]
    fn bad_numbers_are_invalid_queries() {
        let params = Params::parse(Some("from=yesterday"));
        let err = params.number::<i64>("from").unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery(_)));
        assert_eq!(status_of(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(status_of(&QueryError::AllBackendsFailed { attempted: 1 }), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(&QueryError::DeadlineExceeded { outstanding: 1 }), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_of(&QueryError::ClientCanceled).as_u16(), 499);
    }
}
