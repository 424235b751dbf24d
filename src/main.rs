//! plume-proxy
//!
//! ```text
//!   --config (TOML)         --directives (http { ... })
//!         │                          │
//!         ▼                          ▼
//!   ProxyConfig ──────────►  PluginHost ── HttpPlugin ── HttpContext per block
//!                                │
//!                                ├── worker thread 0: runtime + LocalSet + ForwardEngine
//!                                ├── worker thread 1: ...
//!                                │
//!   SIGINT / SIGTERM ──────────► stop: shutdown → join → close listeners
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use plume_proxy::config::{load_config, load_directives, ConfigError, ProxyConfig};
use plume_proxy::lifecycle::wait_for_signal;
use plume_proxy::observability::{logging, metrics};
use plume_proxy::plugin::{HttpPlugin, PluginError, PluginHost};

#[derive(Debug, Parser)]
#[command(name = "plume-proxy", version, about = "Pluggable event-driven HTTP reverse proxy")]
struct Cli {
    /// Runtime configuration (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directive file with the `http { ... }` blocks to serve.
    #[arg(short, long)]
    directives: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid metrics address `{0}`")]
    MetricsAddress(String),
    #[error("Metrics exporter failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

fn main() -> Result<(), ProxyError> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    logging::init(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_threads = config.shared.worker_threads,
        max_fds = config.shared.max_fds,
        "plume-proxy starting"
    );

    if let Err(e) = run(&cli, config) {
        tracing::error!(error = %e, "plume-proxy failed");
        return Err(e);
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

fn run(cli: &Cli, config: ProxyConfig) -> Result<(), ProxyError> {
    // Control-plane runtime: signals and the metrics exporter. Workers run
    // their own runtimes.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| ProxyError::MetricsAddress(config.observability.metrics_address.clone()))?;
        runtime.block_on(async { metrics::init_metrics(addr) })?;
    }

    let directives = load_directives(&cli.directives)?;

    let mut host = PluginHost::new(config);
    host.register(Box::new(HttpPlugin::new()));
    host.configure(&directives)?;
    host.start()?;

    for addr in host.local_addrs() {
        tracing::info!(address = %addr, "Listening for connections");
    }

    match runtime.block_on(wait_for_signal()) {
        Ok(signal) => tracing::info!(signal, "Shutdown requested"),
        Err(e) => tracing::error!(error = %e, "Signal handler failed; shutting down"),
    }

    host.stop()?;
    Ok(())
}
