//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive health checks (tracker.rs):
//!     Backend call finishes
//!     → Dispatcher reports outcome + latency
//!     → Update state.rs
//!
//! Selection:
//!     Group asks tracker.admit(backend)
//!     → Eligible / Probe / Excluded
//!
//! State machine (state.rs):
//!     Healthy → Degraded → Unhealthy → Probation → Healthy
//! ```
//!
//! # Design Decisions
//! - No active probing; a cooled-down backend is probed by real traffic
//! - Health state is per-backend, not per-group
//! - Latency EWMA ranks backends, it never excludes them

pub mod state;
pub mod tracker;

pub use state::{Admission, HealthPolicy, HealthSnapshot, HealthState};
pub use tracker::{HealthTracker, ProbeClaim};
