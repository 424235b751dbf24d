//! Configuration schema definitions.
//!
//! Runtime parameters come from a TOML file; every field has a default so
//! an empty file is a valid configuration. Listeners and backends are not
//! here: they come from the directive file (see `directive.rs`).

use serde::{Deserialize, Serialize};

use crate::pool::PoolOptions;

/// Root runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Parameters shared by every plugin context.
    pub shared: SharedParams,

    pub timeouts: TimeoutConfig,

    pub limits: LimitsConfig,

    pub observability: ObservabilityConfig,
}

/// Host-wide parameters handed to each plugin.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SharedParams {
    /// Maximum file descriptors; sizes each forward-context pool.
    pub max_fds: usize,

    /// Tag stamped on every pool slot.
    pub pool_tag: u32,

    /// Reset pooled contexts on acquire instead of reusing their buffers.
    pub zero_memory: bool,

    /// Validate the tag of released slots.
    pub tag_check: bool,

    /// Worker threads. Above one, pools are shared behind a mutex.
    pub worker_threads: usize,
}

impl Default for SharedParams {
    fn default() -> Self {
        Self {
            max_fds: 1024,
            pool_tag: 0x504c_4d00,
            zero_memory: false,
            tag_check: true,
            worker_threads: 1,
        }
    }
}

impl SharedParams {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            zero_on_acquire: self.zero_memory,
            tag_check: self.tag_check,
            thread_safe: self.worker_threads > 1,
        }
    }
}

/// Timeout configuration (seconds).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connect deadline.
    pub connect_secs: u64,

    /// Idle deadline while sending the request or waiting on the response.
    pub response_secs: u64,

    /// Deadline for reading the client's request.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            response_secs: 30,
            request_secs: 30,
        }
    }
}

/// Request size limits and relay buffer sizing.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_header_bytes: usize,

    pub max_body_bytes: usize,

    /// Bytes read from a backend per read call.
    pub relay_chunk_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_body_bytes: 2 * 1024 * 1024,
            relay_chunk_bytes: 16 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default level for `plume_proxy` targets when `RUST_LOG` is unset.
    pub log_level: String,

    pub metrics_enabled: bool,

    /// Prometheus scrape address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.shared.max_fds, 1024);
        assert!(!config.shared.pool_options().thread_safe);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [shared]
            worker_threads = 4
            zero_memory = true

            [timeouts]
            connect_secs = 1
            "#,
        )
        .unwrap();

        let options = config.shared.pool_options();
        assert!(options.thread_safe && options.zero_on_acquire && options.tag_check);
        assert_eq!(config.timeouts.connect_secs, 1);
        assert_eq!(config.timeouts.response_secs, 30);
        assert_eq!(config.limits, LimitsConfig::default());
    }
}
