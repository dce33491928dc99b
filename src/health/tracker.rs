//! Passive health tracking.
//!
//! # Responsibilities
//! - Observe call outcomes reported by the dispatcher
//! - Drive each backend's [`HealthCell`](super::state::HealthCell)
//! - Hand out the probation probe and take it back when its call is abandoned
//!
//! # Design Decisions
//! - Timeouts count exactly like transport errors
//! - "No data" answers are successes
//! - Transitions are logged and exported as a gauge

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::group::backend::Backend;
use crate::health::state::{Admission, HealthPolicy, HealthState, Transition};
use crate::observability::metrics;
use crate::response::Outcome;

/// Records call results and answers eligibility questions.
#[derive(Debug, Clone, Default)]
pub struct HealthTracker {
    policy: HealthPolicy,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Whether `backend` could be called right now. Does not claim the probe.
    pub fn is_eligible(&self, backend: &Backend) -> bool {
        backend.health().is_eligible(&self.policy, Instant::now())
    }

    /// Admit `backend` for a call.
    ///
    /// Returns `None` when the backend is excluded. A granted probe comes back as a
    /// [`ProbeClaim`] that must be handed to [`report`](Self::report) or dropped.
    pub fn admit(&self, backend: &Arc<Backend>) -> Option<Option<ProbeClaim>> {
        let (admission, transition) = backend.health().admit(&self.policy, Instant::now());
        if let Some(t) = transition {
            log_transition(backend, t);
        }
        match admission {
            Admission::Eligible => Some(None),
            Admission::Probe => {
                tracing::info!(backend = %backend.name(), "Probing backend after cool-down");
                Some(Some(ProbeClaim {
                    backend: backend.clone(),
                    settled: false,
                }))
            }
            Admission::Excluded => None,
        }
    }

    /// Record a finished call.
    pub fn report(
        &self,
        backend: &Backend,
        outcome: Outcome,
        latency: Duration,
        claim: Option<ProbeClaim>,
    ) {
        let probe = match claim {
            Some(mut claim) => {
                claim.settled = true;
                true
            }
            None => false,
        };

        let transition = backend.health().record(
            outcome.is_ok(),
            latency,
            probe,
            &self.policy,
            Instant::now(),
        );

        tracing::debug!(
            backend = %backend.name(),
            outcome = outcome.as_str(),
            latency_ms = latency.as_millis() as u64,
            probe,
            "Backend call recorded"
        );

        if let Some(t) = transition {
            log_transition(backend, t);
        }
    }
}

fn log_transition(backend: &Backend, t: Transition) {
    match t.to {
        HealthState::Healthy | HealthState::Probation => tracing::info!(
            backend = %backend.name(),
            from = t.from.as_str(),
            to = t.to.as_str(),
            "Backend health changed"
        ),
        HealthState::Degraded | HealthState::Unhealthy => tracing::warn!(
            backend = %backend.name(),
            from = t.from.as_str(),
            to = t.to.as_str(),
            "Backend health changed"
        ),
    }
    metrics::record_backend_health(backend.name(), t.to);
}

/// Ownership of a backend's probation probe.
///
/// Dropping an unsettled claim (call aborted by the deadline or cancellation)
/// releases the probe so a later query can try again.
#[derive(Debug)]
pub struct ProbeClaim {
    backend: Arc<Backend>,
    settled: bool,
}

impl Drop for ProbeClaim {
    fn drop(&mut self) {
        if !self.settled {
            self.backend.health().release_probe();
            tracing::debug!(backend = %self.backend.name(), "Probe abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthPolicy {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
            ewma_alpha: 0.3,
        })
    }

    fn fail(tracker: &HealthTracker, backend: &Backend, n: usize) {
        for _ in 0..n {
            tracker.report(backend, Outcome::Timeout, Duration::from_millis(1), None);
        }
    }

    #[test]
    fn excluded_after_repeated_failures() {
        let tracker = tracker();
        let backend = Arc::new(Backend::new("b1", "10.0.0.1:80", "g"));

        fail(&tracker, &backend, 2);
        assert_eq!(backend.health().state(), HealthState::Degraded);
        assert!(tracker.admit(&backend).is_some());

        fail(&tracker, &backend, 2);
        assert_eq!(backend.health().state(), HealthState::Unhealthy);
        assert!(!tracker.is_eligible(&backend));
        assert!(tracker.admit(&backend).is_none());
    }

    #[test]
    fn probe_claim_round_trip() {
        let tracker = tracker();
        let backend = Arc::new(Backend::new("b1", "10.0.0.1:80", "g"));
        fail(&tracker, &backend, 4);

        std::thread::sleep(Duration::from_millis(60));

        let claim = tracker.admit(&backend).expect("admitted").expect("probe");
        assert!(tracker.admit(&backend).is_none(), "second probe must wait");

        tracker.report(&backend, Outcome::Ok, Duration::from_millis(1), Some(claim));
        assert_eq!(backend.health().state(), HealthState::Healthy);
        assert!(!backend.health().snapshot().probe_in_flight);
    }

    #[test]
    fn dropped_claim_releases_probe() {
        let tracker = tracker();
        let backend = Arc::new(Backend::new("b1", "10.0.0.1:80", "g"));
        fail(&tracker, &backend, 4);
        std::thread::sleep(Duration::from_millis(60));

        let claim = tracker.admit(&backend).unwrap();
        assert!(claim.is_some());
        drop(claim);

        assert_eq!(backend.health().state(), HealthState::Probation);
        assert!(matches!(tracker.admit(&backend), Some(Some(_))));
    }
}
