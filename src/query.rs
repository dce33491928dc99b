//! Query model.
//!
//! A [`Query`] is immutable once built. Its [`CacheKey`] is derived from a
//! normalized form of its fields so that equivalent queries share one
//! single-flight entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

use crate::error::QueryError;

/// Largest number of slots one merged render series may hold.
pub const DEFAULT_MAX_POINTS: usize = 100_000;

/// The two query shapes the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Metric path discovery.
    Find,
    /// Time-series retrieval.
    Render,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Find => "find",
            QueryKind::Render => "render",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time range `[from, until)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub until: i64,
}

impl TimeRange {
    pub fn new(from: i64, until: i64) -> Result<Self, QueryError> {
        if from >= until {
            return Err(QueryError::InvalidQuery(format!(
                "time range is empty: from={} until={}",
                from, until
            )));
        }
        if until.checked_sub(from).is_none() {
            return Err(QueryError::InvalidQuery(format!(
                "time range too long: from={} until={}",
                from, until
            )));
        }
        Ok(Self { from, until })
    }

    /// Length in seconds.
    pub fn span(&self) -> u64 {
        self.until.abs_diff(self.from)
    }

    /// Number of `step`-wide slots covering the range.
    pub fn slots(&self, step: u32) -> u64 {
        self.span().div_ceil(u64::from(step.max(1)))
    }

    /// Smallest step, no finer than `step`, that covers the range in at most
    /// `max_points` slots. `None` when no `u32` step is wide enough.
    pub fn fit_step(&self, step: u32, max_points: usize) -> Option<u32> {
        let min = self.span().div_ceil(max_points.max(1) as u64);
        u32::try_from(min.max(u64::from(step.max(1)))).ok()
    }

    /// Range with both ends truncated down to a multiple of `resolution`.
    fn truncated(&self, resolution: u32) -> Self {
        if resolution == 0 {
            return *self;
        }
        let res = resolution as i64;
        Self {
            from: self.from - self.from.rem_euclid(res),
            until: self.until - self.until.rem_euclid(res),
        }
    }
}

/// A single incoming query.
#[derive(Debug, Clone)]
pub struct Query {
    id: Uuid,
    kind: QueryKind,
    targets: Vec<String>,
    range: Option<TimeRange>,
    step: Option<u32>,
    max_points: usize,
    deadline: Instant,
}

impl Query {
    /// Build a `find` query.
    pub fn find<I, S>(targets: I, deadline: Instant) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(QueryKind::Find, targets, None, deadline)
    }

    /// Build a `render` query over `range`.
    pub fn render<I, S>(targets: I, range: TimeRange, deadline: Instant) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(QueryKind::Render, targets, Some(range), deadline)
    }

    fn build<I, S>(
        kind: QueryKind,
        targets: I,
        range: Option<TimeRange>,
        deadline: Instant,
    ) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: Vec<String> = targets
            .into_iter()
            .map(|t| t.into().trim().to_string())
            .collect();

        if targets.is_empty() {
            return Err(QueryError::InvalidQuery("no targets given".into()));
        }
        if targets.iter().any(|t| t.is_empty()) {
            return Err(QueryError::InvalidQuery("empty target".into()));
        }

        let query = Self {
            id: Uuid::new_v4(),
            kind,
            targets,
            range,
            step: None,
            max_points: DEFAULT_MAX_POINTS,
            deadline,
        };
        query.check_points()?;
        Ok(query)
    }

    /// Fix the slot width (seconds) used when merging render results.
    pub fn with_step(mut self, step: u32) -> Result<Self, QueryError> {
        if step == 0 {
            return Err(QueryError::InvalidQuery("step must be positive".into()));
        }
        self.step = Some(step);
        self.check_points()?;
        Ok(self)
    }

    /// Bound the slot count of every merged render series.
    pub fn with_max_points(mut self, max_points: usize) -> Result<Self, QueryError> {
        if max_points == 0 {
            return Err(QueryError::InvalidQuery("max points must be positive".into()));
        }
        self.max_points = max_points;
        self.check_points()?;
        Ok(self)
    }

    fn check_points(&self) -> Result<(), QueryError> {
        let Some(range) = self.range else {
            return Ok(());
        };
        match self.step {
            Some(step) => {
                let slots = range.slots(step);
                if slots > self.max_points as u64 {
                    return Err(QueryError::InvalidQuery(format!(
                        "{} points requested, at most {} allowed",
                        slots, self.max_points
                    )));
                }
                Ok(())
            }
            None => range
                .fit_step(1, self.max_points)
                .map(|_| ())
                .ok_or_else(|| QueryError::InvalidQuery("time range too long".into())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn range(&self) -> Option<TimeRange> {
        self.range
    }

    pub fn step(&self) -> Option<u32> {
        self.step
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Normalized signature used by the single-flight cache.
    ///
    /// Targets are sorted and deduplicated; the render range is truncated to
    /// `resolution` seconds. The deadline and query id are not part of the key.
    pub fn cache_key(&self, resolution: u32) -> CacheKey {
        let mut targets = self.targets.clone();
        targets.sort();
        targets.dedup();

        CacheKey {
            kind: self.kind,
            targets,
            range: self.range.map(|r| r.truncated(resolution)),
            step: self.step,
        }
    }
}

/// Normalized query signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: QueryKind,
    targets: Vec<String>,
    range: Option<TimeRange>,
    step: Option<u32>,
}

impl CacheKey {
    pub fn kind(&self) -> QueryKind {
        self.kind
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.targets.join(","))?;
        if let Some(range) = self.range {
            write!(f, "@{}-{}", range.from, range.until)?;
        }
        if let Some(step) = self.step {
            write!(f, "/{}", step)?;
        }
        Ok(())
    }
}
