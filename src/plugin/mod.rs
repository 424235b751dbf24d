//! Plugin host.
//!
//! # Responsibilities
//! - Route configuration directives to the plugin that owns each command
//! - Run the process and thread lifecycle hooks in order
//! - Own the worker threads and the shutdown signal that stops them
//!
//! # Data Flow
//! ```text
//! directives ──► PluginHost::configure
//!                  block      → Plugin::create_context
//!                  instruction → Plugin::apply (inside the open block)
//!
//! PluginHost::start
//!     → set_shared_config → on_worker_process_start
//!     → per worker thread: Plugin::worker(i)
//!           on_worker_thread_start → run(shutdown) → on_worker_thread_exit
//!
//! PluginHost::stop
//!     → Shutdown::trigger → join workers → on_worker_process_exit
//! ```
//!
//! # Design Decisions
//! - A plugin owns its contexts; the host only knows which block is open
//! - Every worker thread gets its own `PluginWorker` per plugin, so nothing
//!   the worker owns needs to be `Sync`
//! - Blocks do not nest: an instruction belongs to the block that encloses it

pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::broadcast;

use crate::config::{ConfigError, Directive, ProxyConfig};
use crate::index::IndexError;
use crate::lifecycle::Shutdown;
use crate::net::ListenerError;
use crate::pool::PoolError;

pub use http::HttpPlugin;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("Pool setup failed: {0}")]
    Pool(#[from] PoolError),
    #[error("Index setup failed: {0}")]
    Index(#[from] IndexError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{plugin} was not started")]
    NotStarted { plugin: &'static str },
    #[error("Worker thread {0} panicked")]
    WorkerPanicked(String),
}

/// Whether a command opens a block or is a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Block,
    Instruction,
}

/// One entry of a plugin's command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub kind: CommandKind,
}

/// A protocol handler driven by the host.
pub trait Plugin {
    fn name(&self) -> &'static str;

    fn commands(&self) -> &'static [Command];

    /// A block command was opened.
    fn create_context(&mut self, block: &Directive) -> Result<(), ConfigError>;

    /// An instruction inside the most recently opened block.
    fn apply(&mut self, directive: &Directive) -> Result<(), ConfigError>;

    fn set_shared_config(&mut self, config: Arc<ProxyConfig>);

    fn on_worker_process_start(&mut self) -> Result<(), PluginError>;

    fn on_worker_process_exit(&mut self);

    /// Per-thread state for worker `index`.
    fn worker(&mut self, index: usize) -> Result<Box<dyn PluginWorker>, PluginError>;

    /// Addresses the plugin is listening on.
    fn local_addrs(&self) -> Vec<SocketAddr> {
        Vec::new()
    }
}

/// The part of a plugin that runs on one worker thread.
pub trait PluginWorker: Send {
    fn on_worker_thread_start(&mut self, index: usize) {
        tracing::debug!(worker = index, "Worker thread started");
    }

    fn on_worker_thread_exit(&mut self, index: usize) {
        tracing::debug!(worker = index, "Worker thread exiting");
    }

    /// Serve until `shutdown` fires.
    fn run(&mut self, shutdown: broadcast::Receiver<()>) -> Result<(), PluginError>;
}

/// Owns the registered plugins and their worker threads.
pub struct PluginHost {
    plugins: Vec<Box<dyn Plugin>>,
    config: Arc<ProxyConfig>,
    shutdown: Shutdown,
    workers: Vec<(String, JoinHandle<Result<(), PluginError>>)>,
}

impl PluginHost {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            plugins: Vec::new(),
            config: Arc::new(config),
            shutdown: Shutdown::new(),
            workers: Vec::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        tracing::debug!(plugin = plugin.name(), "Plugin registered");
        self.plugins.push(plugin);
    }

    /// Hand every directive to its plugin. Stops at the first error.
    pub fn configure(&mut self, directives: &[Directive]) -> Result<(), ConfigError> {
        for directive in directives {
            if let Err(e) = self.configure_block(directive) {
                tracing::error!(error = %e, "Configuration rejected");
                return Err(e);
            }
        }
        Ok(())
    }

    fn configure_block(&mut self, directive: &Directive) -> Result<(), ConfigError> {
        let (owner, command) = self
            .lookup(&directive.name)
            .ok_or_else(|| ConfigError::command(directive, "unknown command"))?;

        if command.kind == CommandKind::Instruction {
            return Err(ConfigError::command(directive, "must appear inside a block"));
        }
        let children = directive
            .children
            .as_deref()
            .ok_or_else(|| ConfigError::command(directive, "is a block and needs `{ ... }`"))?;

        let plugin = &mut self.plugins[owner];
        plugin.create_context(directive)?;

        for child in children {
            let command = plugin
                .commands()
                .iter()
                .find(|c| c.name == child.name)
                .ok_or_else(|| ConfigError::command(child, "unknown command"))?;
            if command.kind == CommandKind::Block || child.is_block() {
                return Err(ConfigError::command(child, "blocks cannot be nested"));
            }
            plugin.apply(child)?;
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<(usize, Command)> {
        self.plugins.iter().enumerate().find_map(|(i, plugin)| {
            plugin
                .commands()
                .iter()
                .find(|c| c.name == name)
                .map(|c| (i, *c))
        })
    }

    /// Run the process start hooks and spawn the worker threads.
    pub fn start(&mut self) -> Result<(), PluginError> {
        for plugin in &mut self.plugins {
            plugin.set_shared_config(Arc::clone(&self.config));
            plugin.on_worker_process_start()?;
        }

        let threads = self.config.shared.worker_threads;
        for index in 0..threads {
            for plugin in &mut self.plugins {
                let mut worker = plugin.worker(index)?;
                let shutdown = self.shutdown.subscribe();
                let name = format!("{}-worker-{index}", plugin.name());
                let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
                    worker.on_worker_thread_start(index);
                    let result = worker.run(shutdown);
                    worker.on_worker_thread_exit(index);
                    result
                })?;
                self.workers.push((name, handle));
            }
        }

        tracing::info!(
            plugins = self.plugins.len(),
            worker_threads = threads,
            "Plugin host started"
        );
        Ok(())
    }

    /// Stop the workers, wait for them, then run the process exit hooks.
    ///
    /// Returns the first worker error, after every worker has been joined.
    pub fn stop(&mut self) -> Result<(), PluginError> {
        self.shutdown.trigger();

        let mut first_error = None;
        for (name, handle) in self.workers.drain(..) {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(PluginError::WorkerPanicked(name.clone())));
            if let Err(e) = result {
                tracing::error!(worker = %name, error = %e, "Worker failed");
                first_error.get_or_insert(e);
            }
        }

        for plugin in &mut self.plugins {
            plugin.on_worker_process_exit();
        }
        tracing::info!("Plugin host stopped");

        first_error.map_or(Ok(()), Err)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.plugins.iter().flat_map(|p| p.local_addrs()).collect()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_directives;

    #[derive(Default)]
    struct Recorder {
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn commands(&self) -> &'static [Command] {
            const COMMANDS: &[Command] = &[
                Command { name: "rec", kind: CommandKind::Block },
                Command { name: "note", kind: CommandKind::Instruction },
            ];
            COMMANDS
        }

        fn create_context(&mut self, block: &Directive) -> Result<(), ConfigError> {
            self.log.lock().unwrap().push(format!("open {}", block.name));
            Ok(())
        }

        fn apply(&mut self, directive: &Directive) -> Result<(), ConfigError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{} {}", directive.name, directive.params.join(" ")));
            Ok(())
        }

        fn set_shared_config(&mut self, _config: Arc<ProxyConfig>) {}

        fn on_worker_process_start(&mut self) -> Result<(), PluginError> {
            Ok(())
        }

        fn on_worker_process_exit(&mut self) {}

        fn worker(&mut self, _index: usize) -> Result<Box<dyn PluginWorker>, PluginError> {
            Ok(Box::new(IdleWorker))
        }
    }

    struct IdleWorker;

    impl PluginWorker for IdleWorker {
        fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), PluginError> {
            let _ = shutdown.blocking_recv();
            Ok(())
        }
    }

    fn host() -> PluginHost {
        let mut host = PluginHost::new(ProxyConfig::default());
        host.register(Box::new(Recorder::default()));
        host
    }

    fn configure(source: &str) -> Result<(), ConfigError> {
        host().configure(&parse_directives(source).unwrap())
    }

    #[test]
    fn dispatches_blocks_and_instructions() {
        let recorder = Recorder::default();
        let log = Arc::clone(&recorder.log);
        let mut host = PluginHost::new(ProxyConfig::default());
        host.register(Box::new(recorder));

        let directives = parse_directives("rec { note a b; note c; } rec { }").unwrap();
        host.configure(&directives).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["open rec", "note a b", "note c", "open rec"]
        );
    }

    #[test]
    fn rejects_unknown_and_misplaced_commands() {
        let err = configure("nope { }").unwrap_err();
        assert!(err.to_string().contains("unknown command"));

        let err = configure("note a;").unwrap_err();
        assert!(err.to_string().contains("inside a block"));

        let err = configure("rec;").unwrap_err();
        assert!(err.to_string().contains("needs `{ ... }`"));

        let err = configure("rec { rec { } }").unwrap_err();
        assert!(err.to_string().contains("cannot be nested"));

        let err = configure("rec { mystery 1; }").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn start_and_stop_join_workers() {
        let mut config = ProxyConfig::default();
        config.shared.worker_threads = 3;
        let mut host = PluginHost::new(config);
        host.register(Box::new(Recorder::default()));

        host.start().unwrap();
        assert_eq!(host.workers.len(), 3);
        host.stop().unwrap();
        assert!(host.workers.is_empty());
    }
}
