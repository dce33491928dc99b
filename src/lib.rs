//! Metrics query gateway library.
//!
//! Fans graphite-style `find` and `render` queries out to groups of storage
//! backends, merges the answers, tracks backend health and coalesces identical
//! in-flight queries.

// Core model
pub mod error;
pub mod query;
pub mod response;

// Query path
pub mod cache;
pub mod dispatch;
pub mod gateway;
pub mod group;
pub mod health;
pub mod merge;
pub mod resolver;

// Outer surfaces
pub mod admin;
pub mod config;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::GatewayConfig;
pub use error::{CallError, QueryError};
pub use gateway::Gateway;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use query::{Query, QueryKind, TimeRange};
pub use response::{Completeness, MergedResult};
