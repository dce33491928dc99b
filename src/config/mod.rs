//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (apply <PREFIX>_* environment overrides)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → consumed once at startup to build the gateway
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; group membership never changes at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError, DEFAULT_ENV_PREFIX};
pub use schema::{
    CacheConfig, DebugConfig, DispatchConfig, GatewayConfig, GroupConfig, HealthConfig,
    ListenerConfig, ObservabilityConfig, ResolverConfig,
};
