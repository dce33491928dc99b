//! Query fan-out.
//!
//! # Data Flow
//! ```text
//! Query
//!     → for each group: select() (health filter + policy order)
//!     → spawn call tasks into a per-query JoinSet
//!         - broadcast: one task per selected backend
//!         - prefer_first: one task walking the chain, one per probe
//!     → each call: group permit → resolve → transport, bounded by
//!       min(query deadline, group timeout)
//!     → outcomes reported to the health tracker
//!     → PartialResponses collected in completion order
//!     → stop on: all tasks done | deadline | cancellation
//!     → abort whatever is still running
//! ```
//!
//! # Design Decisions
//! - The JoinSet owns every call task, so no call outlives its fan-out
//! - A call cut short by the query deadline is abandoned, not held against the backend
//! - Responses are kept in arrival order; the merger relies on it

pub mod transport;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;
use crate::group::{BackendGroup, Candidate, SelectionPolicy};
use crate::health::HealthTracker;
use crate::observability::metrics;
use crate::query::Query;
use crate::resolver::Resolve;
use crate::response::{CallSummary, Outcome, PartialResponse};
use self::transport::{BackendRequest, BackendTransport};

/// What happens to in-flight work when the caller goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Abort backend calls once no caller is waiting for the result.
    #[default]
    CancelOnDisconnect,
    /// Finish the fan-out and cache the result even if every caller left.
    IgnoreClientTimeout,
}

impl CancellationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationPolicy::CancelOnDisconnect => "cancel_on_disconnect",
            CancellationPolicy::IgnoreClientTimeout => "ignore_client_timeout",
        }
    }
}

/// Which backends a group put in front of a query.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub name: Arc<str>,
    pub policy: SelectionPolicy,
    /// Backends in call order (the whole chain for prefer_first).
    pub selected: Vec<Arc<str>>,
    /// Probation probes dispatched next to a prefer_first chain.
    pub probes: Vec<Arc<str>>,
    pub excluded: usize,
}

impl GroupRecord {
    /// No backend of this group was admitted.
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty() && self.probes.is_empty()
    }
}

/// Everything a fan-out produced.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    /// Responses in completion order.
    pub responses: Vec<PartialResponse>,
    pub groups: Vec<GroupRecord>,
    pub summary: CallSummary,
    pub deadline_hit: bool,
    pub canceled: bool,
}

impl FanOut {
    pub fn successes(&self) -> usize {
        self.summary.succeeded
    }
}

enum CallEvent {
    Started,
    Finished(PartialResponse),
}

/// Shared by every call task of one fan-out.
struct CallContext {
    transport: Arc<dyn BackendTransport>,
    resolver: Arc<dyn Resolve>,
    tracker: HealthTracker,
    request: BackendRequest,
    deadline: Instant,
}

/// Fans a query out to backend groups.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    transport: Arc<dyn BackendTransport>,
    resolver: Arc<dyn Resolve>,
    tracker: HealthTracker,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn BackendTransport>,
        resolver: Arc<dyn Resolve>,
        tracker: HealthTracker,
    ) -> Self {
        Self {
            transport,
            resolver,
            tracker,
        }
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    /// Run one fan-out to completion, deadline or cancellation.
    pub async fn dispatch(
        &self,
        groups: &[Arc<BackendGroup>],
        query: &Query,
        cancel: &CancellationToken,
    ) -> FanOut {
        let ctx = Arc::new(CallContext {
            transport: self.transport.clone(),
            resolver: self.resolver.clone(),
            tracker: self.tracker.clone(),
            request: BackendRequest::from(query),
            deadline: query.deadline(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut records = Vec::with_capacity(groups.len());

        for group in groups {
            let selection = group.select(&self.tracker);
            records.push(GroupRecord {
                name: group.name().clone(),
                policy: selection.policy,
                selected: selection.ordered.iter().map(|c| c.backend.name().clone()).collect(),
                probes: selection.probes.iter().map(|c| c.backend.name().clone()).collect(),
                excluded: selection.excluded,
            });

            match selection.policy {
                SelectionPolicy::Broadcast => {
                    for candidate in selection.ordered {
                        tasks.spawn(call_one(ctx.clone(), group.clone(), candidate, tx.clone()));
                    }
                }
                SelectionPolicy::PreferFirst => {
                    if !selection.ordered.is_empty() {
                        tasks.spawn(walk_chain(ctx.clone(), group.clone(), selection.ordered, tx.clone()));
                    }
                }
            }
            for probe in selection.probes {
                tasks.spawn(call_one(ctx.clone(), group.clone(), probe, tx.clone()));
            }
        }
        drop(tx);

        tracing::debug!(
            query_id = %query.id(),
            groups = groups.len(),
            tasks = tasks.len(),
            "Fan-out started"
        );

        let mut fan_out = FanOut {
            groups: records,
            ..FanOut::default()
        };
        let mut started = 0;
        let deadline = tokio::time::Instant::from_std(query.deadline());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    fan_out.canceled = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    fan_out.deadline_hit = true;
                    // Keep responses that arrived right before the deadline.
                    while let Ok(event) = rx.try_recv() {
                        match event {
                            CallEvent::Started => started += 1,
                            CallEvent::Finished(resp) => fan_out.responses.push(resp),
                        }
                    }
                    break;
                }
                event = rx.recv() => match event {
                    Some(CallEvent::Started) => started += 1,
                    Some(CallEvent::Finished(resp)) => fan_out.responses.push(resp),
                    None => break,
                },
            }
        }

        tasks.abort_all();
        if !fan_out.canceled && query.is_expired() {
            fan_out.deadline_hit = true;
        }
        fan_out.summary = summarize(&fan_out.responses, started);

        if fan_out.summary.abandoned > 0 {
            tracing::debug!(
                query_id = %query.id(),
                abandoned = fan_out.summary.abandoned,
                deadline_hit = fan_out.deadline_hit,
                canceled = fan_out.canceled,
                "Aborted outstanding backend calls"
            );
        }
        fan_out
    }
}

fn summarize(responses: &[PartialResponse], started: usize) -> CallSummary {
    let mut summary = CallSummary {
        called: started.max(responses.len()),
        ..CallSummary::default()
    };
    for resp in responses {
        match resp.outcome() {
            Outcome::Ok => summary.succeeded += 1,
            Outcome::Timeout => summary.timed_out += 1,
            Outcome::Error => summary.failed += 1,
        }
    }
    summary.abandoned = summary.called - responses.len();
    summary
}

async fn call_one(
    ctx: Arc<CallContext>,
    group: Arc<BackendGroup>,
    candidate: Candidate,
    tx: mpsc::UnboundedSender<CallEvent>,
) {
    let _ = tx.send(CallEvent::Started);
    if let Some(resp) = call_backend(&ctx, &group, candidate).await {
        let _ = tx.send(CallEvent::Finished(resp));
    }
}

/// Try backends in order until one succeeds.
async fn walk_chain(
    ctx: Arc<CallContext>,
    group: Arc<BackendGroup>,
    chain: Vec<Candidate>,
    tx: mpsc::UnboundedSender<CallEvent>,
) {
    for candidate in chain {
        if Instant::now() >= ctx.deadline {
            return;
        }
        let _ = tx.send(CallEvent::Started);
        let Some(resp) = call_backend(&ctx, &group, candidate).await else {
            return;
        };
        let succeeded = resp.result.is_ok();
        if tx.send(CallEvent::Finished(resp)).is_err() || succeeded {
            return;
        }
    }
}

/// Perform one bounded call. `None` means the query deadline cut the call short.
async fn call_backend(
    ctx: &CallContext,
    group: &BackendGroup,
    candidate: Candidate,
) -> Option<PartialResponse> {
    let Candidate { backend, probe } = candidate;

    let _permit = match group.limiter().clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return Some(PartialResponse {
                backend: backend.name().clone(),
                group: group.name().clone(),
                result: Err(CallError::Unreachable("group limiter closed".into())),
                latency: Duration::ZERO,
            });
        }
    };

    let remaining = ctx.deadline.saturating_duration_since(Instant::now());
    let budget = remaining.min(group.timeout());
    let cut_by_deadline = remaining < group.timeout();

    let call = backend.start_call();
    let start = Instant::now();

    let attempt = async {
        let addr = ctx
            .resolver
            .resolve(call.address())
            .await
            .map_err(|e| CallError::Unreachable(e.to_string()))?;
        ctx.transport.call(&call, addr, &ctx.request).await
    };

    let result = match tokio::time::timeout(budget, attempt).await {
        Ok(result) => result,
        Err(_) => Err(CallError::Timeout(budget)),
    };
    let latency = start.elapsed();

    let resp = PartialResponse {
        backend: backend.name().clone(),
        group: group.name().clone(),
        result,
        latency,
    };
    let outcome = resp.outcome();

    if outcome == Outcome::Timeout && cut_by_deadline {
        // The query ran out of time, not the backend. A held probe is released on drop.
        tracing::debug!(backend = %backend.name(), "Call cut short by query deadline");
        return None;
    }

    ctx.tracker.report(&backend, outcome, latency, probe);
    metrics::record_backend_call(group.name(), backend.name(), outcome, latency);

    if let Err(e) = &resp.result {
        tracing::debug!(
            group = %group.name(),
            backend = %backend.name(),
            error = %e,
            latency_ms = latency.as_millis() as u64,
            "Backend call failed"
        );
    }

    Some(resp)
}
