//! Backend health state machine.
//!
//! # States
//! - Healthy: backend receives traffic
//! - Degraded: backend still receives traffic, ranked after healthy peers
//! - Unhealthy: backend excluded from selection
//! - Probation: cool-down elapsed, one probe call allowed through
//!
//! # State Transitions
//! ```text
//! Healthy   → Degraded:  consecutive failures >= failure_threshold
//! Degraded  → Unhealthy: further consecutive failures >= failure_threshold
//! Degraded  → Healthy:   one success
//! Unhealthy → Probation: cooldown elapsed (on next admission)
//! Probation → Healthy:   probe succeeds
//! Probation → Unhealthy: probe fails, cool-down restarts
//! ```
//!
//! Each backend owns one [`HealthCell`]; there is no lock spanning backends.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Health state of a single backend.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
    Probation = 3,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Degraded,
            2 => HealthState::Unhealthy,
            3 => HealthState::Probation,
            _ => HealthState::Healthy,
        }
    }
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Probation => "probation",
        }
    }
}

/// Thresholds driving the state machine.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Consecutive failures per step (Healthy→Degraded, Degraded→Unhealthy).
    pub failure_threshold: u32,
    /// Time an unhealthy backend sits out before a probe.
    pub cooldown: Duration,
    /// EWMA weight of the newest latency sample.
    pub ewma_alpha: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            ewma_alpha: 0.3,
        }
    }
}

/// Result of asking whether a backend may be called now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal traffic.
    Eligible,
    /// The single probation probe was granted to this caller.
    Probe,
    /// Not callable right now.
    Excluded,
}

/// A state change caused by an admission or a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Point-in-time copy of a backend's health.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub latency_ewma: Option<Duration>,
    pub since: Instant,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct Inner {
    state: HealthState,
    consecutive_failures: u32,
    latency_ewma_secs: Option<f64>,
    since: Instant,
    probe_in_flight: bool,
}

/// Per-backend health, guarded by its own lock.
#[derive(Debug)]
pub struct HealthCell {
    inner: Mutex<Inner>,
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl HealthCell {
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                latency_ewma_secs: None,
                since: now,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            latency_ewma: inner.latency_ewma_secs.map(Duration::from_secs_f64),
            since: inner.since,
            probe_in_flight: inner.probe_in_flight,
        }
    }

    /// Non-mutating eligibility check.
    pub fn is_eligible(&self, policy: &HealthPolicy, now: Instant) -> bool {
        let inner = self.lock();
        match inner.state {
            HealthState::Healthy | HealthState::Degraded => true,
            HealthState::Unhealthy => now.saturating_duration_since(inner.since) >= policy.cooldown,
            HealthState::Probation => !inner.probe_in_flight,
        }
    }

    /// Admit a call, claiming the probation probe when one is due.
    pub fn admit(&self, policy: &HealthPolicy, now: Instant) -> (Admission, Option<Transition>) {
        let mut inner = self.lock();
        match inner.state {
            HealthState::Healthy | HealthState::Degraded => (Admission::Eligible, None),
            HealthState::Unhealthy => {
                if now.saturating_duration_since(inner.since) < policy.cooldown {
                    return (Admission::Excluded, None);
                }
                inner.state = HealthState::Probation;
                inner.since = now;
                inner.probe_in_flight = true;
                let transition = Transition {
                    from: HealthState::Unhealthy,
                    to: HealthState::Probation,
                };
                (Admission::Probe, Some(transition))
            }
            HealthState::Probation => {
                if inner.probe_in_flight {
                    (Admission::Excluded, None)
                } else {
                    inner.probe_in_flight = true;
                    (Admission::Probe, None)
                }
            }
        }
    }

    /// Record the outcome of a call.
    ///
    /// `probe` marks the call admitted as the probation probe; only that call may
    /// move a backend out of Probation.
    pub fn record(
        &self,
        success: bool,
        latency: Duration,
        probe: bool,
        policy: &HealthPolicy,
        now: Instant,
    ) -> Option<Transition> {
        let mut inner = self.lock();

        let sample = latency.as_secs_f64();
        inner.latency_ewma_secs = Some(match inner.latency_ewma_secs {
            Some(prev) => policy.ewma_alpha * sample + (1.0 - policy.ewma_alpha) * prev,
            None => sample,
        });

        let from = inner.state;
        let threshold = policy.failure_threshold.max(1);

        match (from, success) {
            (HealthState::Healthy, true) => inner.consecutive_failures = 0,
            (HealthState::Degraded, true) => {
                inner.consecutive_failures = 0;
                inner.state = HealthState::Healthy;
            }
            (HealthState::Healthy, false) | (HealthState::Degraded, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= threshold {
                    inner.consecutive_failures = 0;
                    inner.state = if from == HealthState::Healthy {
                        HealthState::Degraded
                    } else {
                        HealthState::Unhealthy
                    };
                }
            }
            (HealthState::Probation, _) if probe => {
                inner.probe_in_flight = false;
                inner.consecutive_failures = 0;
                inner.state = if success {
                    HealthState::Healthy
                } else {
                    HealthState::Unhealthy
                };
            }
            // Stale results of calls admitted before the backend was excluded.
            (HealthState::Unhealthy, _) | (HealthState::Probation, _) => {}
        }

        if inner.state != from {
            inner.since = now;
        }

        (inner.state != from).then_some(Transition {
            from,
            to: inner.state,
        })
    }

    /// Give back a probe claim whose call never completed.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn policy() -> HealthPolicy {
        HealthPolicy {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
            ewma_alpha: 0.5,
        }
    }

    fn fail_n(cell: &HealthCell, n: u32, now: Instant) {
        for _ in 0..n {
            cell.record(false, MS, false, &policy(), now);
        }
    }

    #[test]
    fn degrades_then_becomes_unhealthy() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);

        fail_n(&cell, 2, t0);
        assert_eq!(cell.state(), HealthState::Healthy);

        let t = cell.record(false, MS, false, &policy(), t0);
        assert_eq!(
            t,
            Some(Transition {
                from: HealthState::Healthy,
                to: HealthState::Degraded
            })
        );
        assert!(cell.is_eligible(&policy(), t0));

        fail_n(&cell, 3, t0);
        assert_eq!(cell.state(), HealthState::Unhealthy);
        assert!(!cell.is_eligible(&policy(), t0));
        assert_eq!(cell.admit(&policy(), t0).0, Admission::Excluded);
    }

    #[test]
    fn success_resets_failure_counter() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);

        fail_n(&cell, 2, t0);
        cell.record(true, MS, false, &policy(), t0);
        fail_n(&cell, 2, t0);
        assert_eq!(cell.state(), HealthState::Healthy);
        assert_eq!(cell.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn degraded_recovers_on_success() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);
        fail_n(&cell, 3, t0);
        assert_eq!(cell.state(), HealthState::Degraded);

        cell.record(true, MS, false, &policy(), t0);
        assert_eq!(cell.state(), HealthState::Healthy);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);
        fail_n(&cell, 6, t0);
        assert_eq!(cell.state(), HealthState::Unhealthy);

        let before = t0 + Duration::from_secs(9);
        assert_eq!(cell.admit(&policy(), before).0, Admission::Excluded);

        let after = t0 + Duration::from_secs(10);
        assert!(cell.is_eligible(&policy(), after));
        let (admission, transition) = cell.admit(&policy(), after);
        assert_eq!(admission, Admission::Probe);
        assert_eq!(transition.map(|t| t.to), Some(HealthState::Probation));

        // Only one probe at a time.
        assert_eq!(cell.admit(&policy(), after).0, Admission::Excluded);
        assert!(!cell.is_eligible(&policy(), after));

        cell.record(true, MS, true, &policy(), after);
        assert_eq!(cell.state(), HealthState::Healthy);
        assert_eq!(cell.admit(&policy(), after).0, Admission::Eligible);
    }

    #[test]
    fn failed_probe_restarts_cooldown() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);
        fail_n(&cell, 6, t0);

        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(cell.admit(&policy(), t1).0, Admission::Probe);
        cell.record(false, MS, true, &policy(), t1);
        assert_eq!(cell.state(), HealthState::Unhealthy);

        assert_eq!(cell.admit(&policy(), t1 + Duration::from_secs(5)).0, Admission::Excluded);
        assert_eq!(cell.admit(&policy(), t1 + Duration::from_secs(10)).0, Admission::Probe);
    }

    #[test]
    fn stale_results_do_not_move_probation() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);
        fail_n(&cell, 6, t0);
        let t1 = t0 + Duration::from_secs(10);
        cell.admit(&policy(), t1);

        cell.record(true, MS, false, &policy(), t1);
        assert_eq!(cell.state(), HealthState::Probation);
        cell.record(false, MS, false, &policy(), t1);
        assert_eq!(cell.state(), HealthState::Probation);
    }

    #[test]
    fn released_probe_can_be_claimed_again() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);
        fail_n(&cell, 6, t0);
        let t1 = t0 + Duration::from_secs(10);

        assert_eq!(cell.admit(&policy(), t1).0, Admission::Probe);
        cell.release_probe();
        assert_eq!(cell.state(), HealthState::Probation);
        assert_eq!(cell.admit(&policy(), t1).0, Admission::Probe);
    }

    #[test]
    fn latency_is_smoothed() {
        let t0 = Instant::now();
        let cell = HealthCell::new(t0);
        cell.record(true, Duration::from_millis(100), false, &policy(), t0);
        cell.record(true, Duration::from_millis(300), false, &policy(), t0);

        let ewma = cell.snapshot().latency_ewma.unwrap().as_secs_f64();
        assert!((ewma - 0.2).abs() < 1e-6, "ewma was {}", ewma);
    }
}
