//! One worker thread of the HTTP plugin.
//!
//! # Responsibilities
//! - Run a current-thread tokio runtime with a `LocalSet`
//! - Accept clients on every context's listener
//! - Read one request per client, forward it, and close the connection
//!
//! # Data Flow
//! ```text
//! accept ──► read_request ──► forward(engine) ──► shutdown client
//!                 │                  │
//!                 ▼                  ▼
//!           4xx/5xx reply     502/503 reply when nothing was relayed
//! ```
//!
//! # Design Decisions
//! - Each context gets its own engine per worker; engines are never shared
//!   between threads, only their pools and registries are
//! - Shutdown stops accepting first, then waits for in-flight clients up to
//!   the response timeout

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::LocalSet;

use crate::config::ProxyConfig;
use crate::forward::{forward, ForwardEngine, SharedEngine, TcpConnector};
use crate::http::{error_response, gateway_status, read_request};
use crate::net::{ConnectionGuard, ConnectionPermit, ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::plugin::http::context::ContextPool;
use crate::plugin::{PluginError, PluginWorker};
use crate::registry::BackendRegistry;

/// A worker's share of one `HttpContext`.
#[derive(Debug)]
pub struct Site {
    pub listener: std::net::TcpListener,
    pub pool: ContextPool,
    pub registry: Arc<BackendRegistry>,
}

#[derive(Debug)]
pub struct HttpWorker {
    index: usize,
    sites: Vec<Site>,
    config: Arc<ProxyConfig>,
}

impl HttpWorker {
    pub fn new(index: usize, sites: Vec<Site>, config: Arc<ProxyConfig>) -> Self {
        Self { index, sites, config }
    }
}

impl PluginWorker for HttpWorker {
    fn run(&mut self, shutdown: broadcast::Receiver<()>) -> Result<(), PluginError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        let sites = std::mem::take(&mut self.sites);
        let config = Arc::clone(&self.config);

        local.block_on(&runtime, serve(self.index, sites, config, shutdown))
    }
}

async fn serve(
    index: usize,
    sites: Vec<Site>,
    config: Arc<ProxyConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), PluginError> {
    let tracker = ConnectionTracker::new();
    let mut accept_loops = Vec::with_capacity(sites.len());

    for site in sites {
        let engine = ForwardEngine::new(
            site.pool,
            site.registry,
            TcpConnector,
            config.limits.relay_chunk_bytes,
        )?;
        let listener = Listener::from_std(site.listener, config.shared.max_fds)?;
        tracing::debug!(
            worker = index,
            address = ?listener.local_addr().ok(),
            "Worker accepting"
        );

        accept_loops.push(tokio::task::spawn_local(accept_loop(
            listener,
            Rc::new(RefCell::new(engine)),
            Arc::clone(&config),
            tracker.clone(),
            shutdown.resubscribe(),
        )));
    }

    let _ = shutdown.recv().await;
    for handle in accept_loops {
        let _ = handle.await;
    }

    let grace = Duration::from_secs(config.timeouts.response_secs);
    if !tracker.drain(grace).await {
        tracing::warn!(
            worker = index,
            active = tracker.active_count(),
            "Clients still connected after the grace period"
        );
    }
    tracing::debug!(worker = index, "Worker stopped");
    Ok(())
}

async fn accept_loop(
    listener: Listener,
    engine: SharedEngine,
    config: Arc<ProxyConfig>,
    tracker: ConnectionTracker,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    metrics::record_client_connection();
                    tokio::task::spawn_local(serve_client(
                        stream,
                        peer,
                        permit,
                        tracker.track(),
                        Rc::clone(&engine),
                        Arc::clone(&config),
                    ));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
    engine: SharedEngine,
    config: Arc<ProxyConfig>,
) {
    let key = guard.id();
    let _ = stream.set_nodelay(true);

    let limit = Duration::from_secs(config.timeouts.request_secs);
    let request = match tokio::time::timeout(limit, read_request(&mut stream, &config.limits)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            tracing::debug!(client = %key, peer = %peer, error = %e, "Request rejected");
            if let Some((code, reason)) = e.status() {
                let _ = stream.write_all(&error_response(code, reason)).await;
            }
            let _ = stream.shutdown().await;
            return;
        }
        Err(_) => {
            tracing::debug!(client = %key, peer = %peer, "Request read timed out");
            let _ = stream.write_all(&error_response(408, "Request Timeout")).await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let method = request.method.clone();
    let path = request.path.clone();
    let outcome = forward(&engine, request, &stream, key, &config.timeouts).await;

    if outcome.relayed == 0 {
        if let Some((code, reason)) = gateway_status(outcome.status) {
            let _ = stream.write_all(&error_response(code, reason)).await;
        }
    }
    let _ = stream.shutdown().await;

    tracing::info!(
        client = %key,
        peer = %peer,
        method = %method,
        path = %path,
        status = %outcome.status,
        relayed = outcome.relayed,
        "Request forwarded"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bind_listener;
    use crate::pool::PoolHandle;
    use tokio::io::AsyncReadExt;

    #[test]
    fn serves_until_shutdown() {
        let std_listener = bind_listener("127.0.0.1".parse().unwrap(), 0, 5).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let config = Arc::new(ProxyConfig::default());
        let pool = PoolHandle::new(4, 1, config.shared.pool_options()).unwrap();
        let site = Site {
            listener: std_listener,
            pool,
            registry: Arc::new(BackendRegistry::new()),
        };

        let (tx, rx) = broadcast::channel(1);
        let mut worker = HttpWorker::new(0, vec![site], config);
        let thread = std::thread::spawn(move || worker.run(rx));

        // No backends configured, so the proxy answers 503 on its own.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let response = runtime.block_on(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            response
        });
        assert!(response.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"));

        tx.send(()).unwrap();
        thread.join().unwrap().unwrap();
    }
}
