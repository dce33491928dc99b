//! Single-flight result cache.
//!
//! # Responsibilities
//! - Coalesce concurrent identical queries onto one computation
//! - Keep finished results for a TTL (complete and partial results separately)
//! - Apply the cancellation policy when callers go away
//!
//! # Data Flow
//! ```text
//! get_or_compute(key)
//!     → Ready & fresh       → hit
//!     → Pending             → join: waiters += 1, wait on the flight
//!     → absent / expired    → miss: insert Pending, spawn the computation
//!
//! computation finishes
//!     → entry becomes Ready (or is removed: error, zero TTL)
//!     → result published to every waiter
//!
//! waiter leaves early (cancel, deadline, dropped future)
//!     → waiters -= 1
//!     → at zero under cancel_on_disconnect: cancel flight, remove entry
//! ```
//!
//! # Design Decisions
//! - The computation runs in its own task, owned by the entry rather than by a caller
//! - Waiter counts change only under the entry's shard lock, so a join never races a cancel
//! - Errors are never stored

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::dispatch::CancellationPolicy;
use crate::error::QueryError;
use crate::observability::metrics;
use crate::query::CacheKey;
use crate::response::MergedResult;

type FlightResult = Result<Arc<MergedResult>, QueryError>;

/// How long a waiter lingers past its deadline for a flight that is settling.
const SETTLE_GRACE: Duration = Duration::from_millis(25);

/// How a lookup was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Served from a stored result.
    Hit,
    /// Started a new computation.
    Miss,
    /// Attached to a computation already in flight.
    Joined,
}

impl Lookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lookup::Hit => "hit",
            Lookup::Miss => "miss",
            Lookup::Joined => "joined",
        }
    }
}

/// Cache settings.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub partial_ttl: Duration,
    pub cancellation: CancellationPolicy,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            partial_ttl: Duration::ZERO,
            cancellation: CancellationPolicy::default(),
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub ready: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
}

struct Flight {
    result: watch::Sender<Option<FlightResult>>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

impl Flight {
    fn is_done(&self) -> bool {
        self.result.borrow().is_some()
    }
}

enum Slot {
    Pending(Arc<Flight>),
    Ready {
        result: Arc<MergedResult>,
        expires_at: Instant,
    },
}

impl Slot {
    fn is_flight(&self, flight: &Arc<Flight>) -> bool {
        matches!(self, Slot::Pending(f) if Arc::ptr_eq(f, flight))
    }
}

struct CacheInner {
    entries: DashMap<CacheKey, Slot>,
    policy: CachePolicy,
    root: CancellationToken,
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
}

/// Shared handle to the result cache.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entries.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl ResultCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                policy,
                root: CancellationToken::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                joins: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Number of entries, pending or ready.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Whether `key` currently has a computation in flight.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|slot| matches!(*slot, Slot::Pending(_)))
    }

    /// Stored result of `key`, if fresh.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<MergedResult>> {
        match self.inner.entries.get(key).as_deref() {
            Some(Slot::Ready { result, expires_at }) if *expires_at > Instant::now() => {
                Some(result.clone())
            }
            _ => None,
        }
    }

    /// Serve `key` from the cache, an in-flight computation, or `compute`.
    ///
    /// `compute` receives the flight's cancellation token and only runs on a
    /// miss. The caller stops waiting just past `deadline` or when `client` is
    /// cancelled; what that does to the computation depends on the policy.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        deadline: Instant,
        client: &CancellationToken,
        compute: F,
    ) -> Result<(Arc<MergedResult>, Lookup), QueryError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<MergedResult, QueryError>> + Send + 'static,
    {
        let now = Instant::now();

        let (flight, lookup) = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let in_flight = match entry.get() {
                    Slot::Ready { result, expires_at } if *expires_at > now => {
                        let result = result.clone();
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        metrics::record_cache_request(Lookup::Hit.as_str());
                        return Ok((result, Lookup::Hit));
                    }
                    Slot::Pending(flight) => Some(flight.clone()),
                    Slot::Ready { .. } => None,
                };

                match in_flight {
                    Some(flight) => {
                        flight.waiters.fetch_add(1, Ordering::AcqRel);
                        (flight, Lookup::Joined)
                    }
                    None => {
                        // Expired: start over.
                        let flight = self.new_flight();
                        entry.insert(Slot::Pending(flight.clone()));
                        (flight, Lookup::Miss)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let flight = self.new_flight();
                entry.insert(Slot::Pending(flight.clone()));
                (flight, Lookup::Miss)
            }
        };

        let guard = WaiterGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            flight: flight.clone(),
        };

        match lookup {
            Lookup::Miss => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                let work = compute(flight.cancel.clone());
                tokio::spawn(run_flight(self.inner.clone(), key.clone(), flight.clone(), work));
            }
            Lookup::Joined => {
                self.inner.joins.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Joined in-flight query");
            }
            Lookup::Hit => {}
        }
        metrics::record_cache_request(lookup.as_str());

        let rx = flight.result.subscribe();
        let result = tokio::select! {
            result = wait_result(rx) => result,
            _ = client.cancelled() => Err(QueryError::ClientCanceled),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline + SETTLE_GRACE)) => {
                Err(QueryError::DeadlineExceeded { outstanding: 0 })
            }
        };
        drop(guard);

        result.map(|r| (r, lookup))
    }

    fn new_flight(&self) -> Arc<Flight> {
        let (tx, _) = watch::channel(None);
        Arc::new(Flight {
            result: tx,
            waiters: AtomicUsize::new(1),
            cancel: self.inner.root.child_token(),
        })
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::Pending(_) => true,
        });
        let after = self.inner.entries.len();
        metrics::record_cache_size(after);
        before.saturating_sub(after)
    }

    /// Periodic sweep; runs until shutdown.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.len(), "Swept expired cache entries");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Cache sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Cancel every in-flight computation.
    pub fn cancel_all(&self) {
        self.inner.root.cancel();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            joins: self.inner.joins.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for entry in self.inner.entries.iter() {
            match entry.value() {
                Slot::Pending(_) => stats.pending += 1,
                Slot::Ready { .. } => stats.ready += 1,
            }
        }
        stats
    }
}

async fn wait_result(mut rx: watch::Receiver<Option<FlightResult>>) -> FlightResult {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(|| {
                tracing::warn!("Query computation ended without a result");
                Err(QueryError::AllBackendsFailed { attempted: 0 })
            });
        }
    }
}

async fn run_flight<Fut>(inner: Arc<CacheInner>, key: CacheKey, flight: Arc<Flight>, work: Fut)
where
    Fut: Future<Output = Result<MergedResult, QueryError>> + Send + 'static,
{
    let result = work.await.map(Arc::new);
    inner.settle(&key, &flight, &result);
    flight.result.send_replace(Some(result));
}

impl CacheInner {
    /// Replace the flight's entry with its outcome.
    fn settle(&self, key: &CacheKey, flight: &Arc<Flight>, result: &FlightResult) {
        let ttl = match result {
            Ok(r) if r.completeness.is_complete() => self.policy.ttl,
            Ok(_) => self.policy.partial_ttl,
            Err(_) => Duration::ZERO,
        };

        if let Entry::Occupied(mut entry) = self.entries.entry(key.clone()) {
            if !entry.get().is_flight(flight) {
                return;
            }
            match result {
                Ok(r) if !ttl.is_zero() => {
                    entry.insert(Slot::Ready {
                        result: r.clone(),
                        expires_at: Instant::now() + ttl,
                    });
                }
                _ => {
                    entry.remove();
                }
            }
        }
    }
}

/// One caller waiting on a flight.
struct WaiterGuard {
    inner: Arc<CacheInner>,
    key: CacheKey,
    flight: Arc<Flight>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let policy = self.inner.policy.cancellation;

        match self.inner.entries.entry(self.key.clone()) {
            Entry::Occupied(entry) if entry.get().is_flight(&self.flight) => {
                let remaining = self.flight.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
                if remaining == 0
                    && policy == CancellationPolicy::CancelOnDisconnect
                    && !self.flight.is_done()
                {
                    entry.remove();
                    self.flight.cancel.cancel();
                    tracing::debug!(key = %self.key, "Last waiter left, in-flight query cancelled");
                }
            }
            _ => {
                self.flight.waiters.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::response::{CallSummary, Completeness, MergedPayload};
    use std::sync::atomic::AtomicBool;

    fn key(target: &str) -> CacheKey {
        Query::find([target], Instant::now() + Duration::from_secs(1))
            .unwrap()
            .cache_key(60)
    }

    fn result(paths: &[&str], completeness: Completeness) -> MergedResult {
        MergedResult {
            payload: MergedPayload::Paths(paths.iter().map(|p| p.to_string()).collect()),
            completeness,
            summary: CallSummary::default(),
        }
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    fn cache(cancellation: CancellationPolicy) -> ResultCache {
        ResultCache::new(CachePolicy {
            ttl: Duration::from_secs(30),
            partial_ttl: Duration::ZERO,
            cancellation,
        })
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = cache(CancellationPolicy::CancelOnDisconnect);
        let runs = Arc::new(AtomicUsize::new(0));
        let k = key("a.*");

        let call = |cache: ResultCache, runs: Arc<AtomicUsize>, k: CacheKey| async move {
            let token = CancellationToken::new();
            cache
                .get_or_compute(&k, in_secs(5), &token, move |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(result(&["a.b"], Completeness::Complete))
                })
                .await
        };

        let (first, second) = tokio::join!(
            call(cache.clone(), runs.clone(), k.clone()),
            call(cache.clone(), runs.clone(), k.clone()),
        );

        let (first, first_lookup) = first.unwrap();
        let (second, second_lookup) = second.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first_lookup, Lookup::Miss);
        assert_eq!(second_lookup, Lookup::Joined);

        let (_, lookup) = call(cache.clone(), runs.clone(), k).await.unwrap();
        assert_eq!(lookup, Lookup::Hit);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_and_partials_are_not_stored() {
        let cache = cache(CancellationPolicy::CancelOnDisconnect);
        let token = CancellationToken::new();

        let err = cache
            .get_or_compute(&key("x"), in_secs(5), &token, |_| async {
                Err(QueryError::AllBackendsFailed { attempted: 2 })
            })
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::AllBackendsFailed { attempted: 2 });
        assert!(cache.is_empty());

        let (partial, _) = cache
            .get_or_compute(&key("y"), in_secs(5), &token, |_| async {
                Ok(result(&["y"], Completeness::Partial))
            })
            .await
            .unwrap();
        assert_eq!(partial.completeness, Completeness::Partial);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn last_waiter_leaving_cancels_computation() {
        let cache = cache(CancellationPolicy::CancelOnDisconnect);
        let k = key("slow");
        let cancelled = Arc::new(AtomicBool::new(false));
        let client = CancellationToken::new();

        let seen = cancelled.clone();
        let canceller = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = cache
            .get_or_compute(&k, in_secs(5), &client, move |flight| async move {
                tokio::select! {
                    _ = flight.cancelled() => {
                        seen.store(true, Ordering::SeqCst);
                        Err(QueryError::ClientCanceled)
                    }
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(result(&[], Completeness::Complete)),
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err, QueryError::ClientCanceled);
        assert!(!cache.is_pending(&k));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn ignore_client_timeout_completes_and_caches() {
        let cache = cache(CancellationPolicy::IgnoreClientTimeout);
        let k = key("slow");

        let err = cache
            .get_or_compute(&k, Instant::now() + Duration::from_millis(20), &CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(result(&["slow.a"], Completeness::Complete))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::DeadlineExceeded { .. }));
        assert!(cache.is_pending(&k));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = cache.peek(&k).expect("result cached after caller left");
        assert_eq!(stored.paths().unwrap(), ["slow.a"]);
    }

    #[tokio::test]
    async fn joiner_keeps_flight_alive_when_leader_leaves() {
        let cache = cache(CancellationPolicy::CancelOnDisconnect);
        let k = key("shared");
        let leader = CancellationToken::new();

        let leader_cache = cache.clone();
        let leader_key = k.clone();
        let leader_token = leader.clone();
        let leader_task = tokio::spawn(async move {
            leader_cache
                .get_or_compute(&leader_key, in_secs(5), &leader_token, |_| async {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Ok(result(&["shared.x"], Completeness::Complete))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let joiner_cache = cache.clone();
        let joiner_key = k.clone();
        let joiner = tokio::spawn(async move {
            joiner_cache
                .get_or_compute(&joiner_key, in_secs(5), &CancellationToken::new(), |_| async {
                    Ok(result(&["never"], Completeness::Complete))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.cancel();
        assert_eq!(leader_task.await.unwrap().unwrap_err(), QueryError::ClientCanceled);

        let (value, lookup) = joiner.await.unwrap().unwrap();
        assert_eq!(lookup, Lookup::Joined);
        assert_eq!(value.paths().unwrap(), ["shared.x"]);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let cache = ResultCache::new(CachePolicy {
            ttl: Duration::from_millis(10),
            ..CachePolicy::default()
        });
        cache
            .get_or_compute(&key("t"), in_secs(5), &CancellationToken::new(), |_| async {
                Ok(result(&["t"], Completeness::Complete))
            })
            .await
            .unwrap();
        assert_eq!(cache.stats().ready, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.peek(&key("t")).is_none());
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }
}
