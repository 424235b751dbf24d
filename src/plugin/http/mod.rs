//! The HTTP reverse-proxy plugin.
//!
//! # Responsibilities
//! - Own the command table (`http`, `http_listen`, `http_backend`)
//! - Keep one `HttpContext` per `http { }` block
//! - Open pools and listeners on worker-process start, close them on exit
//! - Hand each worker thread its share of every context
//!
//! # Data Flow
//! ```text
//! http { ... }        → HttpContext::new
//! http_listen ...     → HttpContext::set_listen
//! http_backend ...    → HttpContext::add_backend
//! process start       → HttpContext::open (pool + listener)
//! Plugin::worker(i)   → HttpWorker { listener clone, pool handle, registry }
//! ```

pub mod context;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{ConfigError, Directive, ProxyConfig};
use crate::plugin::{Command, CommandKind, Plugin, PluginError, PluginWorker};

pub use context::{HttpContext, DEFAULT_BACKLOG};
pub use worker::HttpWorker;

const COMMANDS: &[Command] = &[
    Command {
        name: "http",
        kind: CommandKind::Block,
    },
    Command {
        name: "http_listen",
        kind: CommandKind::Instruction,
    },
    Command {
        name: "http_backend",
        kind: CommandKind::Instruction,
    },
];

#[derive(Debug, Default)]
pub struct HttpPlugin {
    contexts: Vec<HttpContext>,
    config: Arc<ProxyConfig>,
}

impl HttpPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contexts(&self) -> &[HttpContext] {
        &self.contexts
    }
}

impl Plugin for HttpPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn commands(&self) -> &'static [Command] {
        COMMANDS
    }

    fn create_context(&mut self, block: &Directive) -> Result<(), ConfigError> {
        if !block.params.is_empty() {
            return Err(ConfigError::command(block, "takes no parameters"));
        }
        self.contexts.push(HttpContext::new(block.line));
        Ok(())
    }

    fn apply(&mut self, directive: &Directive) -> Result<(), ConfigError> {
        let ctx = self
            .contexts
            .last_mut()
            .ok_or_else(|| ConfigError::command(directive, "must appear inside `http { }`"))?;
        match directive.name.as_str() {
            "http_listen" => ctx.set_listen(directive),
            "http_backend" => ctx.add_backend(directive),
            _ => Err(ConfigError::command(directive, "unknown command")),
        }
    }

    fn set_shared_config(&mut self, config: Arc<ProxyConfig>) {
        self.config = config;
    }

    fn on_worker_process_start(&mut self) -> Result<(), PluginError> {
        for ctx in &mut self.contexts {
            ctx.open(&self.config.shared)?;
        }
        Ok(())
    }

    fn on_worker_process_exit(&mut self) {
        for ctx in &mut self.contexts {
            ctx.close();
        }
    }

    fn worker(&mut self, index: usize) -> Result<Box<dyn PluginWorker>, PluginError> {
        let mut sites = Vec::with_capacity(self.contexts.len());
        for ctx in &mut self.contexts {
            sites.push(worker::Site {
                listener: ctx.worker_listener()?,
                pool: ctx.worker_pool()?,
                registry: Arc::clone(ctx.registry()),
            });
        }
        Ok(Box::new(HttpWorker::new(index, sites, Arc::clone(&self.config))))
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.contexts.iter().filter_map(HttpContext::local_addr).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_directives;
    use crate::plugin::PluginHost;

    #[test]
    fn one_context_per_block() {
        let source = r#"
            http {
                http_listen 127.0.0.1 0;
                http_backend 10.0.0.1 80;
                http_backend 10.0.0.2 80;
            }
            http {
                http_listen 127.0.0.1 0 64;
            }
        "#;
        let mut plugin = HttpPlugin::new();
        for block in parse_directives(source).unwrap() {
            plugin.create_context(&block).unwrap();
            for child in block.children.unwrap() {
                plugin.apply(&child).unwrap();
            }
        }

        let contexts = plugin.contexts();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].registry().len(), 2);
        assert_eq!(contexts[0].backlog, DEFAULT_BACKLOG);
        assert!(contexts[1].registry().is_empty());
        assert_eq!(contexts[1].backlog, 64);
    }

    #[test]
    fn block_parameters_are_rejected() {
        let mut host = PluginHost::new(ProxyConfig::default());
        host.register(Box::new(HttpPlugin::new()));
        let err = host
            .configure(&parse_directives("http public { }").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("takes no parameters"));
    }

    #[test]
    fn process_start_opens_every_context() {
        let mut host = PluginHost::new(ProxyConfig::default());
        host.register(Box::new(HttpPlugin::new()));
        let source = "http { http_listen 127.0.0.1 0; } http { http_listen 127.0.0.1 0; }";
        host.configure(&parse_directives(source).unwrap()).unwrap();

        host.start().unwrap();
        let addrs = host.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0], addrs[1]);

        host.stop().unwrap();
        assert!(host.local_addrs().is_empty());
    }
}
