//! Tokio readiness driver for the forward engine.
//!
//! # Data Flow
//! ```text
//! forward(engine, request, client)
//!     → engine.start_forward[_body]   (callback → oneshot)
//!     → loop:
//!         Step::Pending { wait }  → await backend/client readiness
//!                                 → engine.handle(event) per ready direction
//!         client hangup           → engine.handle(ClientClosed)
//!         timeout                 → engine.expire
//!         Step::Finished          → done
//! ```
//!
//! # Design Decisions
//! - The engine sits in an `Rc<RefCell<_>>` shared by every client task of
//!   a worker; a borrow is never held across an `.await`
//! - Writable is delivered before readable so queued body bytes go out
//!   before the response is read
//! - Timeouts are idle timeouts: each wait gets the full budget
//! - The client socket is watched for hangups in every state, so a vanished
//!   client cancels its forward at once

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::TimeoutConfig;
use crate::forward::{
    Completion, ForwardEngine, ForwardState, ForwardStatus, IoEvent, Step, TcpConnector, Wait,
};
use crate::http::ProxyRequest;
use crate::net::ConnectionId;

/// Reads spent discarding client bytes per wakeup. Each connection carries
/// one request, so anything sent after it is dropped.
const MAX_DISCARD_READS: usize = 16;

/// Engine shared by the tasks of one worker thread.
pub type SharedEngine = Rc<RefCell<ForwardEngine<TcpConnector>>>;

/// How a forward ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub status: ForwardStatus,
    /// Response bytes that reached the client.
    pub relayed: u64,
}

/// Proxy `request` for `client` and wait until the forward completes.
pub async fn forward(
    engine: &SharedEngine,
    request: ProxyRequest,
    client: &TcpStream,
    key: ConnectionId,
    timeouts: &TimeoutConfig,
) -> ForwardOutcome {
    let (tx, rx) = oneshot::channel();
    let callback: Completion = Box::new(move |status| {
        let _ = tx.send(status);
    });

    let mut step = {
        let mut eng = engine.borrow_mut();
        if request.post_receive {
            eng.start_forward_body(request, key, callback)
        } else {
            eng.start_forward(request, key, callback)
        }
    };

    let relayed = loop {
        let (id, wait) = match step {
            Step::Pending { id, wait } => (id, wait),
            Step::Finished { relayed, .. } => break relayed,
            Step::Stale => break 0,
        };

        let (conn, connecting) = {
            let eng = engine.borrow();
            (
                eng.backend_conn(id),
                eng.state(id) == Some(ForwardState::AwaitBackendConnect),
            )
        };
        let Some(conn) = conn else {
            step = engine.borrow_mut().abort(id, ForwardStatus::IoError);
            continue;
        };

        let limit = Duration::from_secs(if connecting {
            timeouts.connect_secs
        } else {
            timeouts.response_secs
        });

        step = match tokio::time::timeout(limit, readiness(&conn, client, wait)).await {
            Ok(Ok(events)) => {
                let mut eng = engine.borrow_mut();
                let mut next = Step::Pending { id, wait };
                for event in events.into_iter().flatten() {
                    next = eng.handle(id, event, client);
                    if !matches!(next, Step::Pending { .. }) {
                        break;
                    }
                }
                next
            }
            Ok(Err(e)) => {
                tracing::debug!(forward = %id, error = %e, "Readiness wait failed");
                engine.borrow_mut().abort(id, ForwardStatus::IoError)
            }
            Err(_) => engine.borrow_mut().expire(id),
        };
    };

    // The callback has already run by the time a step reports `Finished`.
    let status = rx.await.unwrap_or(ForwardStatus::IoError);
    ForwardOutcome { status, relayed }
}

/// Wait for whatever `wait` asks for; returns the directions that became ready.
///
/// The client is always watched for a hangup, whatever the forward waits on.
async fn readiness(conn: &TcpStream, client: &TcpStream, wait: Wait) -> io::Result<[Option<IoEvent>; 3]> {
    let interest = wait.backend_interest();
    tokio::select! {
        ready = conn.ready(interest.unwrap_or(Interest::READABLE)), if interest.is_some() => {
            let ready = ready?;
            Ok([
                (ready.is_writable() || ready.is_write_closed()).then_some(IoEvent::BackendWritable),
                (ready.is_readable() || ready.is_read_closed()).then_some(IoEvent::BackendReadable),
                None,
            ])
        }
        writable = client.writable(), if wait.client_write => {
            writable?;
            Ok([None, None, Some(IoEvent::ClientWritable)])
        }
        ready = client.ready(Interest::READABLE) => {
            let ready = ready?;
            let closed = ready.is_read_closed() || client_hung_up(client);
            Ok([None, None, closed.then_some(IoEvent::ClientClosed)])
        }
    }
}

/// Discard stray client bytes. `true` once the client has closed or reset.
fn client_hung_up(client: &TcpStream) -> bool {
    let mut sink = [0u8; 512];
    for _ in 0..MAX_DISCARD_READS {
        match client.try_read(&mut sink) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::pool::{PoolHandle, PoolOptions};
    use crate::registry::BackendRegistry;

    fn shared_engine(backend: SocketAddr) -> SharedEngine {
        let mut registry = BackendRegistry::new();
        registry.add(backend);
        let pool = PoolHandle::new(8, 0x504c_4d00, PoolOptions::default()).unwrap();
        let engine = ForwardEngine::new(pool, Arc::new(registry), TcpConnector, 4096).unwrap();
        Rc::new(RefCell::new(engine))
    }

    async fn client_pair() -> (TcpStream, TcpStream) {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = front.accept().await.unwrap();
        (client, accepted)
    }

    #[tokio::test]
    async fn relays_a_response_end_to_end() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let origin = tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.ends_with(b"hello") {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "proxy closed before sending the body");
                received.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            received
        });

        let (mut client, accepted) = client_pair().await;
        let engine = shared_engine(backend_addr);
        let head = "POST /items HTTP/1.1\r\nHost: origin\r\nContent-Length: 5\r\n\r\n";
        let request = ProxyRequest::new(head, "hello");

        let outcome = forward(&engine, request, &accepted, ConnectionId::new(), &TimeoutConfig::default()).await;
        assert_eq!(outcome.status, ForwardStatus::Success);
        drop(accepted);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(outcome.relayed, response.len() as u64);

        let received = origin.await.unwrap();
        assert_eq!(received, format!("{head}hello").into_bytes());
        assert_eq!(engine.borrow().pool().in_use(), 0);
    }

    #[tokio::test]
    async fn client_hangup_cancels_a_waiting_forward() {
        // Connects complete against the backlog; nothing ever answers.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let engine = shared_engine(backend.local_addr().unwrap());
        let (client, accepted) = client_pair().await;
        drop(client);

        let request = ProxyRequest::new("GET / HTTP/1.1\r\n\r\n", "");
        let timeouts = TimeoutConfig {
            response_secs: 30,
            ..TimeoutConfig::default()
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            forward(&engine, request, &accepted, ConnectionId::new(), &timeouts),
        )
        .await
        .expect("forward outlived its client");

        assert_eq!(outcome.status, ForwardStatus::ClientDisconnected);
        let eng = engine.borrow();
        assert_eq!(eng.in_flight(), 0);
        assert_eq!(eng.pool().in_use(), 0);
        assert_eq!(eng.registry().backends()[0].failures(), 0);
    }

    #[tokio::test]
    async fn unreachable_backend_reports_status() {
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (_client, accepted) = client_pair().await;
        let engine = shared_engine(closed);

        let request = ProxyRequest::new("GET / HTTP/1.1\r\n\r\n", "");
        let outcome = forward(&engine, request, &accepted, ConnectionId::new(), &TimeoutConfig::default()).await;

        assert_eq!(outcome.status, ForwardStatus::BackendUnreachable);
        assert_eq!(outcome.relayed, 0);
        assert_eq!(engine.borrow().in_flight(), 0);
    }
}
