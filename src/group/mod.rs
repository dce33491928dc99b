//! Backend groups and selection.
//!
//! # Data Flow
//! ```text
//! Query admitted
//!     → for each group: select()
//!         - tracker.admit() each backend (filters Unhealthy, claims probes)
//!         - Apply the group's selector:
//!             - broadcast.rs (call every admitted backend)
//!             - prefer_first.rs (rank by latency, fall back on failure)
//!     → Selection handed to the dispatcher
//! ```
//!
//! # Design Decisions
//! - Membership is fixed at configuration load; only health changes
//! - Selector is chosen per group
//! - A group with nothing admitted is a failed group, not a failed query
//! - Each group carries its own concurrency ceiling

pub mod backend;
pub mod broadcast;
pub mod pool;
pub mod prefer_first;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::health::{HealthTracker, ProbeClaim};
use self::backend::Backend;
use self::broadcast::Broadcast;
use self::prefer_first::PreferFirst;

/// How a group spreads a query over its backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Call every eligible backend and merge the overlap.
    #[default]
    Broadcast,
    /// Call the best-ranked backend, advance to the next only on failure.
    PreferFirst,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Broadcast => "broadcast",
            SelectionPolicy::PreferFirst => "prefer_first",
        }
    }
}

/// Arranges admitted backends into a call plan.
pub trait Selector: Send + Sync + std::fmt::Debug {
    fn policy(&self) -> SelectionPolicy;

    /// Order `admitted` (configuration order on input) into a [`Selection`].
    fn arrange(&self, admitted: Vec<Candidate>) -> Selection;
}

/// A backend admitted for one query.
#[derive(Debug)]
pub struct Candidate {
    pub backend: Arc<Backend>,
    /// Present when this call is the backend's probation probe.
    pub probe: Option<ProbeClaim>,
}

impl Candidate {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

/// The call plan of one group for one query.
#[derive(Debug)]
pub struct Selection {
    pub policy: SelectionPolicy,
    /// Backends in call order. Broadcast calls all of them; prefer_first walks them.
    pub ordered: Vec<Candidate>,
    /// Probation probes dispatched next to the first prefer_first attempt.
    pub probes: Vec<Candidate>,
    /// Backends filtered out by the health tracker.
    pub excluded: usize,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty() && self.probes.is_empty()
    }
}

/// A named set of data-equivalent backends.
#[derive(Debug)]
pub struct BackendGroup {
    name: Arc<str>,
    backends: Vec<Arc<Backend>>,
    selector: Box<dyn Selector>,
    timeout: Duration,
    max_concurrent: usize,
    limiter: Arc<Semaphore>,
}

impl BackendGroup {
    pub fn new(
        name: impl Into<Arc<str>>,
        backends: Vec<Arc<Backend>>,
        policy: SelectionPolicy,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        let selector: Box<dyn Selector> = match policy {
            SelectionPolicy::Broadcast => Box::new(Broadcast::new()),
            SelectionPolicy::PreferFirst => Box::new(PreferFirst::new()),
        };
        let max_concurrent = max_concurrent.max(1);
        Self {
            name: name.into(),
            backends,
            selector,
            timeout,
            max_concurrent,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.selector.policy()
    }

    /// Per-backend call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Semaphore bounding this group's in-flight calls.
    pub fn limiter(&self) -> &Arc<Semaphore> {
        &self.limiter
    }

    /// Filter out ineligible backends and order the rest by the group's policy.
    pub fn select(&self, tracker: &HealthTracker) -> Selection {
        let mut admitted = Vec::with_capacity(self.backends.len());
        let mut excluded = 0;

        for backend in &self.backends {
            match tracker.admit(backend) {
                Some(probe) => admitted.push(Candidate {
                    backend: backend.clone(),
                    probe,
                }),
                None => excluded += 1,
            }
        }

        let mut selection = self.selector.arrange(admitted);
        selection.excluded = excluded;

        if selection.is_empty() {
            tracing::warn!(
                group = %self.name,
                backend_count = self.backends.len(),
                "No eligible backends in group"
            );
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthPolicy, HealthState};
    use crate::response::Outcome;

    fn group(policy: SelectionPolicy) -> BackendGroup {
        let backends = (1..=3)
            .map(|i| Arc::new(Backend::new(format!("b{}", i), format!("10.0.0.{}:80", i), "g")))
            .collect();
        BackendGroup::new("g", backends, policy, Duration::from_secs(1), 4)
    }

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthPolicy {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            ewma_alpha: 0.5,
        })
    }

    #[test]
    fn unhealthy_backends_are_excluded() {
        let tracker = tracker();
        let g = group(SelectionPolicy::Broadcast);

        // threshold 1: two failures take b2 to Unhealthy.
        for _ in 0..2 {
            tracker.report(&g.backends()[1], Outcome::Error, Duration::from_millis(1), None);
        }
        assert_eq!(g.backends()[1].health().state(), HealthState::Unhealthy);

        let selection = g.select(&tracker);
        let names: Vec<_> = selection.ordered.iter().map(|c| c.backend.name().to_string()).collect();
        assert_eq!(names, vec!["b1", "b3"]);
        assert_eq!(selection.excluded, 1);
    }

    #[test]
    fn empty_selection_when_all_excluded() {
        let tracker = tracker();
        let g = group(SelectionPolicy::PreferFirst);
        for b in g.backends() {
            for _ in 0..2 {
                tracker.report(b, Outcome::Timeout, Duration::from_millis(1), None);
            }
        }

        let selection = g.select(&tracker);
        assert!(selection.is_empty());
        assert_eq!(selection.excluded, 3);
    }

    #[test]
    fn concurrency_ceiling_is_at_least_one() {
        let g = BackendGroup::new("g", Vec::new(), SelectionPolicy::Broadcast, Duration::from_secs(1), 0);
        assert_eq!(g.max_concurrent(), 1);
        assert_eq!(g.limiter().available_permits(), 1);
    }
}
