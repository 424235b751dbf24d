//! Configuration and process-wide resources of one `http { }` block.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::{ConfigError, Directive, SharedParams};
use crate::forward::ForwardContext;
use crate::net::bind_listener;
use crate::plugin::PluginError;
use crate::pool::PoolHandle;
use crate::registry::BackendRegistry;

/// Backlog used when `http_listen` leaves it out.
pub const DEFAULT_BACKLOG: u32 = 5;

pub type ContextPool = PoolHandle<ForwardContext<Arc<TcpStream>>>;

/// One `http { }` block.
#[derive(Debug)]
pub struct HttpContext {
    /// Line of the `http` directive, for error reports.
    pub line: usize,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub backlog: u32,
    registry: Arc<BackendRegistry>,
    pool: Option<ContextPool>,
    listener: Option<std::net::TcpListener>,
}

impl HttpContext {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            ip: None,
            port: 0,
            backlog: DEFAULT_BACKLOG,
            registry: Arc::new(BackendRegistry::new()),
            pool: None,
            listener: None,
        }
    }

    /// `http_listen <ip> <port> [backlog]`
    pub fn set_listen(&mut self, directive: &Directive) -> Result<(), ConfigError> {
        let params = &directive.params;
        if !(2..=3).contains(&params.len()) {
            return Err(ConfigError::command(directive, "expects `<ip> <port> [backlog]`"));
        }

        let ip = parse_ip(directive, &params[0])?;
        let port = parse_port(directive, &params[1])?;
        let backlog = match params.get(2) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::command(directive, format!("invalid backlog `{raw}`"))),
            },
            None => DEFAULT_BACKLOG,
        };

        if let Some(previous) = self.ip {
            tracing::warn!(
                line = directive.line,
                previous = %SocketAddr::new(previous, self.port),
                "http_listen repeated; the last one wins"
            );
        }
        self.ip = Some(ip);
        self.port = port;
        self.backlog = backlog;
        Ok(())
    }

    /// `http_backend <ip> <port>`
    pub fn add_backend(&mut self, directive: &Directive) -> Result<(), ConfigError> {
        let params = &directive.params;
        if params.len() != 2 {
            return Err(ConfigError::command(directive, "expects `<ip> <port>`"));
        }

        let ip = parse_ip(directive, &params[0])?;
        let port = parse_port(directive, &params[1])?;
        if port == 0 {
            return Err(ConfigError::command(directive, "backend port cannot be 0"));
        }

        let registry = Arc::get_mut(&mut self.registry)
            .ok_or_else(|| ConfigError::command(directive, "backends cannot be added after start"))?;
        registry.add(SocketAddr::new(ip, port));
        Ok(())
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Create the forward-context pool and open the listening socket.
    pub fn open(&mut self, shared: &SharedParams) -> Result<(), PluginError> {
        let ip = self.ip.ok_or_else(|| {
            ConfigError::Command {
                line: self.line,
                command: "http".to_string(),
                message: "block has no `http_listen`".to_string(),
            }
        })?;

        let pool = ContextPool::new(shared.max_fds, shared.pool_tag, shared.pool_options())?;
        let listener = bind_listener(ip, self.port, self.backlog)?;

        tracing::info!(
            address = %listener.local_addr().unwrap_or(SocketAddr::new(ip, self.port)),
            backends = self.registry.len(),
            pool_capacity = pool.capacity(),
            "HTTP context opened"
        );
        self.pool = Some(pool);
        self.listener = Some(listener);
        Ok(())
    }

    /// Stop listening. In-flight forwards keep their own handles.
    pub fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            tracing::info!(
                address = ?listener.local_addr().ok(),
                "HTTP context closed"
            );
        }
        self.pool = None;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// A listener clone for one worker.
    pub fn worker_listener(&self) -> Result<std::net::TcpListener, PluginError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(not_started)?;
        Ok(listener.try_clone()?)
    }

    /// A pool handle for one worker: the exclusive pool moves to the only
    /// worker, a shared pool is handed to every worker.
    pub fn worker_pool(&mut self) -> Result<ContextPool, PluginError> {
        let shared = match &self.pool {
            Some(pool) => pool.share(),
            None => return Err(not_started()),
        };
        match shared {
            Some(handle) => Ok(handle),
            None => self.pool.take().ok_or_else(not_started),
        }
    }
}

impl Drop for HttpContext {
    fn drop(&mut self) {
        self.close();
        match Arc::get_mut(&mut self.registry) {
            Some(registry) => {
                let removed = registry.remove_all();
                tracing::debug!(line = self.line, removed, "HTTP context destroyed");
            }
            None => tracing::debug!(line = self.line, "HTTP context destroyed while backends are in use"),
        }
    }
}

fn not_started() -> PluginError {
    PluginError::NotStarted { plugin: "http" }
}

fn parse_ip(directive: &Directive, raw: &str) -> Result<IpAddr, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::command(directive, format!("invalid ip address `{raw}`")))
}

fn parse_port(directive: &Directive, raw: &str) -> Result<u16, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::command(directive, format!("invalid port `{raw}`")))
}
