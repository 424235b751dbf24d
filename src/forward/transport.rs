//! Non-blocking byte transports and backend connection setup.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::TcpStream;

/// Non-blocking socket operations. `WouldBlock` means "wait for readiness".
pub trait Transport {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_read(buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }
}

/// Opens backend connections for the engine.
pub trait BackendConnector {
    type Conn: Transport;

    /// Start a non-blocking connect. An in-progress connect is `Ok`.
    fn connect(&self, addr: SocketAddr) -> io::Result<Self::Conn>;

    /// Called once the connection is writable; reports the connect result.
    fn finish_connect(&self, conn: &Self::Conn) -> io::Result<()>;

    /// Hand back a connection whose exchange completed cleanly.
    ///
    /// Dropping closes it. A keep-alive pool would keep it here.
    fn recycle(&self, addr: SocketAddr, conn: Self::Conn) {
        tracing::trace!(backend = %addr, "Backend connection closed");
        drop(conn);
    }
}

/// Plain TCP connector backed by the tokio reactor.
///
/// Must be used from inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl BackendConnector for TcpConnector {
    type Conn = Arc<TcpStream>;

    fn connect(&self, addr: SocketAddr) -> io::Result<Self::Conn> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e),
        }

        let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(stream))
    }

    fn finish_connect(&self, conn: &Self::Conn) -> io::Result<()> {
        if let Some(e) = conn.take_error()? {
            return Err(e);
        }
        // Writable without a pending error can still mean "not connected"
        // on some platforms; the peer address settles it.
        conn.peer_addr().map(|_| ())
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}
