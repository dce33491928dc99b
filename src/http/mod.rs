//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (one per configured listener, all sharing one router)
//!     → server.rs (Axum setup, request ID, trace, timeout)
//!     → handlers.rs (parse query string, build Query)
//!     → Gateway::query (cancelled if the client goes away)
//!     → JSON body + X-Gateway-Completeness
//! ```

pub mod handlers;
pub mod server;

pub use handlers::X_GATEWAY_COMPLETENESS;
pub use server::{AppState, HttpServer, X_REQUEST_ID};
