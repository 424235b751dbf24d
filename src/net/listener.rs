//! TCP listener with a configurable backlog and backpressure.
//!
//! # Responsibilities
//! - Create the listening socket (`socket2`, so the backlog is ours)
//! - Accept incoming TCP connections on each worker's runtime
//! - Enforce a per-worker connection limit via semaphore
//!
//! # Design Decisions
//! - The socket is bound once per plugin context and cloned into every
//!   worker; each worker registers its clone with its own reactor

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
    #[error("Listener connection limit closed")]
    Closed,
}

/// Open a non-blocking listening socket on `ip:port` with `backlog`.
pub fn bind_listener(ip: IpAddr, port: u16, backlog: u32) -> Result<std::net::TcpListener, ListenerError> {
    let addr = SocketAddr::new(ip, port);
    let bind = || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        Ok(socket.into())
    };
    let listener = bind().map_err(|source| ListenerError::Bind { addr, source })?;

    tracing::info!(
        address = %listener.local_addr().unwrap_or(addr),
        backlog,
        "Listener bound"
    );
    Ok(listener)
}

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, accepting waits until a permit is returned.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Register a bound std listener with the current runtime.
    pub fn from_std(listener: std::net::TcpListener, max_connections: usize) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: TcpListener::from_std(listener)?,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// The returned permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Permit first (backpressure).
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot. Dropping it frees the slot, even if the handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
