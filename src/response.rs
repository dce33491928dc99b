//! Response shapes flowing from backends to the caller.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CallError;

/// One time series as returned by a backend or produced by the merge.
///
/// `values[i]` is the value at `start + i * step`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    #[serde(rename = "target")]
    pub name: String,
    pub start: i64,
    pub step: u32,
    pub values: Vec<Option<f64>>,
}

impl Series {
    /// Iterate over `(timestamp, value)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (i64, Option<f64>)> + '_ {
        let step = self.step as i64;
        self.values
            .iter()
            .enumerate()
            .map(move |(i, v)| (self.start.saturating_add((i as i64).saturating_mul(step)), *v))
    }
}

/// Data carried by a successful backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Paths(Vec<String>),
    Series(Vec<Series>),
}

/// Outcome of a single backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Timeout,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Timeout => "timeout",
            Outcome::Error => "error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

/// The result of one attempted backend call within a query's fan-out.
#[derive(Debug, Clone)]
pub struct PartialResponse {
    pub backend: Arc<str>,
    pub group: Arc<str>,
    pub result: Result<Payload, CallError>,
    pub latency: Duration,
}

impl PartialResponse {
    pub fn outcome(&self) -> Outcome {
        match &self.result {
            Ok(_) => Outcome::Ok,
            Err(e) if e.is_timeout() => Outcome::Timeout,
            Err(_) => Outcome::Error,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.result.as_ref().ok()
    }
}

/// Whether every expected data source contributed to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Complete => "complete",
            Completeness::Partial => "partial",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

/// Merged data of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum MergedPayload {
    Paths(Vec<String>),
    Series(Vec<Series>),
}

/// Per-query call accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub called: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub abandoned: usize,
}

/// The caller-visible answer to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedResult {
    pub payload: MergedPayload,
    pub completeness: Completeness,
    pub summary: CallSummary,
}

impl MergedResult {
    pub fn paths(&self) -> Option<&[String]> {
        match &self.payload {
            MergedPayload::Paths(p) => Some(p),
            MergedPayload::Series(_) => None,
        }
    }

    pub fn series(&self) -> Option<&[Series]> {
        match &self.payload {
            MergedPayload::Series(s) => Some(s),
            MergedPayload::Paths(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_points_follow_step() {
        let s = Series {
            name: "a".into(),
            start: 100,
            step: 10,
            values: vec![Some(1.0), None, Some(3.0)],
        };
        let points: Vec<_> = s.points().collect();
        assert_eq!(points, vec![(100, Some(1.0)), (110, None), (120, Some(3.0))]);
    }

    #[test]
    fn outcome_from_result() {
        let mut resp = PartialResponse {
            backend: "b1".into(),
            group: "g".into(),
            result: Ok(Payload::Paths(vec![])),
            latency: Duration::from_millis(3),
        };
        assert_eq!(resp.outcome(), Outcome::Ok);

        resp.result = Err(CallError::Timeout(Duration::from_millis(3)));
        assert_eq!(resp.outcome(), Outcome::Timeout);

        resp.result = Err(CallError::Status(503));
        assert_eq!(resp.outcome(), Outcome::Error);
        assert!(resp.payload().is_none());
    }
}
