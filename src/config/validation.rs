//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds >= 1)
//! - Detect duplicate group names and duplicate backends within a group
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() {
        errors.push(ValidationError::new("listeners", "at least one listener is required"));
    }
    for (i, listener) in config.listeners.iter().enumerate() {
        if listener.address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                format!("listeners[{}].address", i),
                format!("'{}' is not a socket address", listener.address),
            ));
        }
    }

    if config.dispatch.default_timeout_ms == 0 {
        errors.push(ValidationError::new("dispatch.default_timeout_ms", "must be positive"));
    }
    if config.dispatch.max_timeout_ms < config.dispatch.default_timeout_ms {
        errors.push(ValidationError::new(
            "dispatch.max_timeout_ms",
            "must not be smaller than default_timeout_ms",
        ));
    }
    if config.dispatch.max_response_bytes == 0 {
        errors.push(ValidationError::new("dispatch.max_response_bytes", "must be positive"));
    }
    if config.dispatch.max_points == 0 {
        errors.push(ValidationError::new("dispatch.max_points", "must be positive"));
    }

    if config.health.failure_threshold == 0 {
        errors.push(ValidationError::new("health.failure_threshold", "must be at least 1"));
    }
    if !(config.health.ewma_alpha > 0.0 && config.health.ewma_alpha <= 1.0) {
        errors.push(ValidationError::new("health.ewma_alpha", "must be in (0, 1]"));
    }

    if config.resolver.caching && config.resolver.refresh_interval_ms == 0 {
        errors.push(ValidationError::new("resolver.refresh_interval_ms", "must be positive"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.debug.enabled
        && !config.debug.listen.is_empty()
        && config.debug.listen.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "debug.listen",
            format!("'{}' is not a socket address", config.debug.listen),
        ));
    }

    if config.groups.is_empty() {
        errors.push(ValidationError::new("groups", "at least one backend group is required"));
    }

    let mut group_names = HashSet::new();
    for (i, group) in config.groups.iter().enumerate() {
        let field = |name: &str| format!("groups[{}].{}", i, name);

        if group.name.trim().is_empty() {
            errors.push(ValidationError::new(field("name"), "must not be empty"));
        } else if !group_names.insert(group.name.as_str()) {
            errors.push(ValidationError::new(
                field("name"),
                format!("duplicate group name '{}'", group.name),
            ));
        }

        if group.timeout_ms == 0 {
            errors.push(ValidationError::new(field("timeout_ms"), "must be positive"));
        }
        if group.max_concurrent == 0 {
            errors.push(ValidationError::new(field("max_concurrent"), "must be at least 1"));
        }
        if group.backends.is_empty() {
            errors.push(ValidationError::new(field("backends"), "must list at least one backend"));
        }

        let mut seen = HashSet::new();
        for backend in &group.backends {
            if !is_host_port(backend) {
                errors.push(ValidationError::new(
                    field("backends"),
                    format!("'{}' is not host:port", backend),
                ));
            }
            if !seen.insert(backend.as_str()) {
                errors.push(ValidationError::new(
                    field("backends"),
                    format!("duplicate backend '{}'", backend),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_host_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
