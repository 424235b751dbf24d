//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: `&ProxyConfig → Result<(), Vec<ValidationError>>`

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("shared.worker_threads ({threads}) exceeds shared.max_fds ({max_fds})")]
    TooManyWorkers { threads: usize, max_fds: usize },
    #[error("unknown log level `{0}`")]
    LogLevel(String),
    #[error("invalid metrics address `{0}`")]
    MetricsAddress(String),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let positive = [
        ("shared.max_fds", config.shared.max_fds as u64),
        ("shared.worker_threads", config.shared.worker_threads as u64),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.response_secs", config.timeouts.response_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("limits.max_header_bytes", config.limits.max_header_bytes as u64),
        ("limits.relay_chunk_bytes", config.limits.relay_chunk_bytes as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.shared.worker_threads > config.shared.max_fds {
        errors.push(ValidationError::TooManyWorkers {
            threads: config.shared.worker_threads,
            max_fds: config.shared.max_fds,
        });
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::LogLevel(config.observability.log_level.clone()));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
