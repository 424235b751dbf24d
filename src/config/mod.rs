//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! runtime file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (immutable)
//!
//! directive file (command language)
//!     → directive.rs (tokenize, nest blocks)
//!     → plugin host (dispatch to plugin commands)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no live reload
//! - All runtime fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod directive;
pub mod loader;
pub mod schema;
pub mod validation;

pub use directive::{parse_directives, Directive, DirectiveError};
pub use loader::{load_config, load_directives, ConfigError};
pub use schema::{LimitsConfig, ObservabilityConfig, ProxyConfig, SharedParams, TimeoutConfig};
