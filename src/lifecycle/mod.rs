//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → metrics exporter → resolver (+refresh) → gateway → cache sweeper → listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → stop accepting → drain in-flight requests → cancel flights → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Every background loop subscribes to the same broadcast

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
