//! Broadcast selection strategy.

use crate::group::{Candidate, Selection, SelectionPolicy, Selector};

/// Broadcast selector.
/// Every admitted backend is called; probes travel with the rest.
#[derive(Debug, Default)]
pub struct Broadcast;

impl Broadcast {
    pub fn new() -> Self {
        Self
    }
}

impl Selector for Broadcast {
    fn policy(&self) -> SelectionPolicy {
        SelectionPolicy::Broadcast
    }

    fn arrange(&self, admitted: Vec<Candidate>) -> Selection {
        Selection {
            policy: SelectionPolicy::Broadcast,
            ordered: admitted,
            probes: Vec::new(),
            excluded: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::backend::Backend;
    use std::sync::Arc;

    #[test]
    fn keeps_configuration_order() {
        let admitted = ["b2", "b1", "b3"]
            .iter()
            .map(|n| Candidate {
                backend: Arc::new(Backend::new(*n, "127.0.0.1:1", "g")),
                probe: None,
            })
            .collect();

        let selection = Broadcast::new().arrange(admitted);
        let names: Vec<_> = selection.ordered.iter().map(|c| c.backend.name().to_string()).collect();
        assert_eq!(names, vec!["b2", "b1", "b3"]);
        assert!(selection.probes.is_empty());
    }
}
