//! Query entry point.
//!
//! # Data Flow
//! ```text
//! Query
//!     → cache key (normalized targets, truncated range)
//!     → ResultCache::get_or_compute
//!         → on miss: Dispatcher::dispatch → merge
//!     → Arc<MergedResult> or QueryError
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::{CachePolicy, ResultCache};
use crate::config::GatewayConfig;
use crate::dispatch::transport::BackendTransport;
use crate::dispatch::{Dispatcher, FanOut};
use crate::error::QueryError;
use crate::group::pool::GroupRegistry;
use crate::health::HealthTracker;
use crate::merge::merge;
use crate::observability::metrics;
use crate::query::Query;
use crate::resolver::Resolve;
use crate::response::MergedResult;

/// Serves queries against the configured backend groups.
#[derive(Debug)]
pub struct Gateway {
    groups: Arc<GroupRegistry>,
    dispatcher: Dispatcher,
    cache: ResultCache,
    resolution: u32,
}

impl Gateway {
    pub fn new(groups: GroupRegistry, dispatcher: Dispatcher, cache: ResultCache, resolution: u32) -> Self {
        Self {
            groups: Arc::new(groups),
            dispatcher,
            cache,
            resolution,
        }
    }

    /// Build the gateway described by `config`.
    pub fn from_config(
        config: &GatewayConfig,
        transport: Arc<dyn BackendTransport>,
        resolver: Arc<dyn Resolve>,
    ) -> Self {
        let groups = GroupRegistry::new(&config.groups);
        let tracker = HealthTracker::new(config.health.policy());
        let dispatcher = Dispatcher::new(transport, resolver, tracker);
        let cache = ResultCache::new(CachePolicy {
            ttl: Duration::from_millis(config.cache.ttl_ms),
            partial_ttl: Duration::from_millis(config.cache.partial_ttl_ms),
            cancellation: config.dispatch.cancellation,
        });

        Self::new(groups, dispatcher, cache, config.cache.resolution_secs)
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn tracker(&self) -> &HealthTracker {
        self.dispatcher.tracker()
    }

    /// Answer `query`.
    ///
    /// `cancel` signals that the caller no longer wants the answer.
    pub async fn query(
        &self,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<Arc<MergedResult>, QueryError> {
        let start = Instant::now();
        let key = query.cache_key(self.resolution);
        let kind = query.kind();
        let query_id = query.id();
        let deadline = query.deadline();

        let dispatcher = self.dispatcher.clone();
        let groups = self.groups.groups().to_vec();

        let outcome = self
            .cache
            .get_or_compute(&key, deadline, cancel, move |flight| async move {
                let fan_out = dispatcher.dispatch(&groups, &query, &flight).await;
                conclude(&query, fan_out)
            })
            .await;

        match outcome {
            Ok((result, lookup)) => {
                tracing::info!(
                    query_id = %query_id,
                    kind = kind.as_str(),
                    key = %key,
                    cache = lookup.as_str(),
                    completeness = result.completeness.as_str(),
                    called = result.summary.called,
                    failed = result.summary.failed + result.summary.timed_out,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Query served"
                );
                metrics::record_query(kind, result.completeness.as_str(), start);
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(
                    query_id = %query_id,
                    kind = kind.as_str(),
                    key = %key,
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Query failed"
                );
                metrics::record_query(kind, e.label(), start);
                Err(e)
            }
        }
    }
}

/// Turn a finished fan-out into a result or a query failure.
fn conclude(query: &Query, fan_out: FanOut) -> Result<MergedResult, QueryError> {
    if fan_out.successes() > 0 {
        return Ok(merge(query, &fan_out));
    }

    if fan_out.canceled {
        Err(QueryError::ClientCanceled)
    } else if fan_out.deadline_hit {
        Err(QueryError::DeadlineExceeded {
            outstanding: fan_out.summary.abandoned,
        })
    } else {
        Err(QueryError::AllBackendsFailed {
            attempted: fan_out.summary.called,
        })
    }
}
