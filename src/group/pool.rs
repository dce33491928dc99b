//! Backend group registry.
//!
//! # Responsibilities
//! - Build backend groups from configuration
//! - Expose groups to the dispatcher in configuration order
//! - List every backend (for status reporting)

use std::sync::Arc;
use std::time::Duration;

use crate::config::GroupConfig;
use crate::group::{backend::Backend, BackendGroup};

/// Holds every configured backend group.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: Vec<Arc<BackendGroup>>,
}

impl GroupRegistry {
    /// Create the registry from configuration.
    pub fn new(configs: &[GroupConfig]) -> Self {
        let groups = configs
            .iter()
            .map(|config| {
                let backends = config
                    .backends
                    .iter()
                    .map(|address| Arc::new(Backend::new(address.as_str(), address.as_str(), config.name.as_str())))
                    .collect();

                tracing::debug!(
                    group = %config.name,
                    policy = config.policy.as_str(),
                    backends = config.backends.len(),
                    "Backend group configured"
                );

                Arc::new(BackendGroup::new(
                    config.name.as_str(),
                    backends,
                    config.policy,
                    Duration::from_millis(config.timeout_ms),
                    config.max_concurrent,
                ))
            })
            .collect();

        Self { groups }
    }

    /// Build a registry from ready-made groups.
    pub fn from_groups(groups: Vec<BackendGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn groups(&self) -> &[Arc<BackendGroup>] {
        &self.groups
    }

    pub fn get(&self, name: &str) -> Option<&Arc<BackendGroup>> {
        self.groups.iter().find(|g| g.name().as_ref() == name)
    }

    /// Return a list of all backends.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.groups
            .iter()
            .flat_map(|g| g.backends().iter())
            .cloned()
            .collect()
    }
}
