//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single metric-storage endpoint
//! - Track in-flight calls (for status reporting)
//! - Own the backend's health cell

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::health::state::HealthCell;

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// Identity used in logs, metrics and responses.
    name: Arc<str>,
    /// `host:port` as configured; resolved per call.
    address: String,
    /// Owning group.
    group: Arc<str>,
    /// Number of calls currently in flight.
    in_flight: AtomicUsize,
    /// Health state, mutated through the tracker only.
    health: HealthCell,
}

impl Backend {
    pub fn new(name: impl Into<Arc<str>>, address: impl Into<String>, group: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            group: group.into(),
            in_flight: AtomicUsize::new(0),
            health: HealthCell::default(),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn group(&self) -> &Arc<str> {
        &self.group
    }

    pub fn health(&self) -> &HealthCell {
        &self.health
    }

    /// Get the current number of in-flight calls.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Mark a call as started. The count drops again when the guard is dropped.
    pub fn start_call(self: &Arc<Self>) -> CallGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        CallGuard {
            backend: self.clone(),
        }
    }
}

/// A RAII guard that manages the in-flight call count.
#[derive(Debug)]
pub struct CallGuard {
    backend: Arc<Backend>,
}

impl Deref for CallGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
