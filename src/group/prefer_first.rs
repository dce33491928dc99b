//! Prefer-first selection strategy with fallback.

use std::time::Duration;

use crate::group::{Candidate, Selection, SelectionPolicy, Selector};
use crate::health::HealthState;

/// Prefer-first selector.
/// Ranks healthy backends before degraded ones, then by smoothed latency.
/// Ties keep configuration order (stable sort).
#[derive(Debug, Default)]
pub struct PreferFirst;

impl PreferFirst {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for PreferFirst {
    fn policy(&self) -> SelectionPolicy {
        SelectionPolicy::PreferFirst
    }

    fn arrange(&self, admitted: Vec<Candidate>) -> Selection {
        let (probes, mut ordered): (Vec<_>, Vec<_>) = admitted.into_iter().partition(Candidate::is_probe);

        ordered.sort_by_cached_key(|c| {
            let snapshot = c.backend.health().snapshot();
            let degraded = snapshot.state == HealthState::Degraded;
            // Unmeasured backends rank as fast so they get measured.
            (degraded, snapshot.latency_ewma.unwrap_or(Duration::ZERO))
        });

        Selection {
            policy: SelectionPolicy::PreferFirst,
            ordered,
            probes,
            excluded: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::backend::Backend;
    use crate::health::HealthPolicy;
    use std::sync::Arc;
    use std::time::Instant;

    fn candidate(name: &str, latency_ms: Option<u64>) -> Candidate {
        let backend = Arc::new(Backend::new(name, "127.0.0.1:1", "g"));
        if let Some(ms) = latency_ms {
            backend.health().record(
                true,
                Duration::from_millis(ms),
                false,
                &HealthPolicy::default(),
                Instant::now(),
            );
        }
        Candidate { backend, probe: None }
    }

    fn names(selection: &Selection) -> Vec<String> {
        selection.ordered.iter().map(|c| c.backend.name().to_string()).collect()
    }

    #[test]
    fn ranks_by_latency() {
        let admitted = vec![
            candidate("slow", Some(80)),
            candidate("fast", Some(5)),
            candidate("mid", Some(20)),
        ];
        let selection = PreferFirst::new().arrange(admitted);
        assert_eq!(names(&selection), vec!["fast", "mid", "slow"]);
    }

    #[test]
    fn degraded_ranks_last() {
        let policy = HealthPolicy {
            failure_threshold: 1,
            ..HealthPolicy::default()
        };
        let degraded = candidate("degraded", Some(1));
        degraded
            .backend
            .health()
            .record(false, Duration::from_millis(1), false, &policy, Instant::now());
        assert_eq!(degraded.backend.health().state(), HealthState::Degraded);

        let selection = PreferFirst::new().arrange(vec![degraded, candidate("healthy", Some(50))]);
        assert_eq!(names(&selection), vec!["healthy", "degraded"]);
    }

    #[test]
    fn ties_keep_configuration_order() {
        let admitted = vec![candidate("a", None), candidate("b", None), candidate("c", None)];
        let selection = PreferFirst::new().arrange(admitted);
        assert_eq!(names(&selection), vec!["a", "b", "c"]);
    }
}
