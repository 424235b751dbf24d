//! Pluggable, event-driven HTTP reverse proxy.

pub mod config;
pub mod forward;
pub mod http;
pub mod index;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod plugin;
pub mod pool;
pub mod registry;

pub use config::schema::ProxyConfig;
pub use forward::{ForwardEngine, ForwardStatus};
pub use lifecycle::Shutdown;
pub use plugin::{HttpPlugin, PluginHost};
