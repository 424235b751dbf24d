//! Per-request forward state.
//!
//! # Responsibilities
//! - Hold everything one forward needs between readiness events
//! - Drive header/body sends through resumable byte cursors
//! - Relay response bytes to the client with backpressure
//!
//! # Design Decisions
//! - Contexts live in the lookaside pool and are reused; `begin` resets
//!   every per-request field but keeps buffer capacity
//! - Header/body/post-receive progress is the `ForwardState` plus two
//!   cursors, not a set of independent flags

use std::fmt;
use std::io;

use bytes::{Buf, BytesMut};

use crate::forward::{Completion, ForwardState, ForwardStatus, Transport, Wait};
use crate::http::{Feed, ProxyRequest, ResponseFraming};
use crate::net::ConnectionId;
use crate::registry::BackendGuard;

/// Backend reads per event before yielding back to the event loop.
const MAX_READS_PER_EVENT: usize = 16;

/// How the request body is sequenced against the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyMode {
    /// Body fully sent before the response is awaited.
    #[default]
    Sequential,
    /// Response bytes may be relayed while the body is still being sent.
    PostReceive,
}

/// Byte offset into a buffer being written out.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendCursor {
    offset: usize,
}

impl SendCursor {
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn is_done(&self, data: &[u8]) -> bool {
        self.offset >= data.len()
    }

    /// Write from the current offset. `Ok(true)` once everything is out,
    /// `Ok(false)` when the transport would block.
    fn send<T: Transport + ?Sized>(&mut self, conn: &T, data: &[u8]) -> io::Result<bool> {
        while self.offset < data.len() {
            match conn.try_write(&data[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Outcome of advancing a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Wait(Wait),
    Finished(ForwardStatus),
}

/// What a finished context hands back to the engine.
pub(crate) struct Finished<S> {
    pub callback: Option<Completion>,
    pub conn: Option<S>,
    pub backend: Option<BackendGuard>,
    pub reusable: bool,
    pub relayed: u64,
}

/// State of one proxied request.
pub struct ForwardContext<S> {
    state: ForwardState,
    pub(crate) request: ProxyRequest,
    pub(crate) backend: Option<BackendGuard>,
    pub(crate) conn: Option<S>,
    header: SendCursor,
    body: SendCursor,
    mode: BodyMode,
    relay: BytesMut,
    scratch: Vec<u8>,
    framing: ResponseFraming,
    response_complete: bool,
    pub(crate) client: Option<ConnectionId>,
    callback: Option<Completion>,
    relayed: u64,
    entered: Vec<ForwardState>,
}

impl<S> Default for ForwardContext<S> {
    fn default() -> Self {
        Self {
            state: ForwardState::Init,
            request: ProxyRequest::default(),
            backend: None,
            conn: None,
            header: SendCursor::default(),
            body: SendCursor::default(),
            mode: BodyMode::default(),
            relay: BytesMut::new(),
            scratch: Vec::new(),
            framing: ResponseFraming::default(),
            response_complete: false,
            client: None,
            callback: None,
            relayed: 0,
            entered: Vec::new(),
        }
    }
}

impl<S> fmt::Debug for ForwardContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardContext")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("client", &self.client)
            .field("header_offset", &self.header.offset)
            .field("body_offset", &self.body.offset)
            .field("relayed", &self.relayed)
            .finish_non_exhaustive()
    }
}

impl<S> ForwardContext<S> {
    pub fn state(&self) -> ForwardState {
        self.state
    }

    pub fn mode(&self) -> BodyMode {
        self.mode
    }

    pub fn header_cursor(&self) -> SendCursor {
        self.header
    }

    pub fn body_cursor(&self) -> SendCursor {
        self.body
    }

    /// Bytes written to the client so far.
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Reset for a new request. Buffers keep their capacity.
    pub(crate) fn begin(
        &mut self,
        request: ProxyRequest,
        client: ConnectionId,
        callback: Completion,
        mode: BodyMode,
        relay_chunk: usize,
    ) {
        self.framing.reset(request.is_head());
        self.request = request;
        self.backend = None;
        self.conn = None;
        self.header = SendCursor::default();
        self.body = SendCursor::default();
        self.mode = mode;
        self.relay.clear();
        self.scratch.resize(relay_chunk.max(1), 0);
        self.response_complete = false;
        self.client = Some(client);
        self.callback = Some(callback);
        self.relayed = 0;
        self.entered.clear();
        self.enter(ForwardState::Init);
    }

    pub(crate) fn connecting(&mut self, backend: BackendGuard, conn: S) {
        self.backend = Some(backend);
        self.conn = Some(conn);
        self.enter(ForwardState::AwaitBackendConnect);
    }

    pub(crate) fn connected(&mut self) {
        self.enter(ForwardState::SendHeader);
    }

    /// States entered since the last drain, oldest first.
    pub(crate) fn drain_transitions(&mut self) -> std::vec::Drain<'_, ForwardState> {
        self.entered.drain(..)
    }

    /// Enter `Done` or `Failed` and give up the resources the engine disposes of.
    pub(crate) fn finish(&mut self, status: ForwardStatus) -> Finished<S> {
        self.enter(if status.is_success() {
            ForwardState::Done
        } else {
            ForwardState::Failed
        });

        let reusable = status.is_success() && self.body_done() && self.framing.reusable();
        // Drop the payload now; an idle pooled context should not pin it.
        self.request = ProxyRequest::default();
        self.relay.clear();
        self.client = None;

        Finished {
            callback: self.callback.take(),
            conn: self.conn.take(),
            backend: self.backend.take(),
            reusable,
            relayed: self.relayed,
        }
    }

    fn enter(&mut self, state: ForwardState) {
        tracing::trace!(from = ?self.state, to = ?state, "Forward state transition");
        self.state = state;
        self.entered.push(state);
    }

    fn body_done(&self) -> bool {
        self.body.is_done(&self.request.body)
    }
}

impl<S: Transport> ForwardContext<S> {
    /// Do as much work as the sockets allow in the current state.
    pub(crate) fn advance<T: Transport + ?Sized>(&mut self, client: &T) -> Progress {
        if self.state == ForwardState::AwaitBackendConnect {
            return Progress::Wait(Wait::BACKEND_WRITABLE);
        }

        if self.state == ForwardState::SendHeader {
            match self.send_header() {
                Ok(true) if self.request.has_body() => self.enter(ForwardState::SendBody),
                Ok(true) => self.enter(ForwardState::AwaitResponse),
                Ok(false) => return Progress::Wait(Wait::BACKEND_WRITABLE),
                Err(e) => {
                    tracing::debug!(error = %e, "Request head send failed");
                    return Progress::Finished(ForwardStatus::IoError);
                }
            }
        }

        if self.state == ForwardState::SendBody {
            match self.send_body() {
                Ok(true) => self.enter(ForwardState::AwaitResponse),
                // The rest of the body goes out alongside the response.
                Ok(false) if self.mode == BodyMode::PostReceive => self.enter(ForwardState::AwaitResponse),
                Ok(false) => return Progress::Wait(Wait::BACKEND_WRITABLE),
                Err(e) => {
                    tracing::debug!(error = %e, "Request body send failed");
                    return Progress::Finished(ForwardStatus::IoError);
                }
            }
        }

        if self.state == ForwardState::AwaitResponse {
            return self.relay_response(client);
        }

        Progress::Finished(ForwardStatus::IoError)
    }

    fn relay_response<T: Transport + ?Sized>(&mut self, client: &T) -> Progress {
        if !self.body_done() {
            if let Err(e) = self.send_body() {
                if !self.response_complete {
                    tracing::debug!(error = %e, "Request body send failed");
                    return Progress::Finished(ForwardStatus::IoError);
                }
            }
        }

        let mut reads = 0;
        loop {
            match self.flush_relay(client) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Client write failed");
                    return Progress::Finished(ForwardStatus::ClientDisconnected);
                }
            }
            if self.response_complete || reads == MAX_READS_PER_EVENT {
                break;
            }
            reads += 1;

            let n = match self.read_backend() {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Backend read failed");
                    return Progress::Finished(ForwardStatus::IoError);
                }
            };

            if n == 0 {
                if let Err(e) = self.framing.on_eof() {
                    tracing::debug!(error = %e, "Backend response ended early");
                    return Progress::Finished(ForwardStatus::IoError);
                }
                self.response_complete = true;
                continue;
            }

            match self.framing.feed(&self.scratch[..n]) {
                Ok(Feed::Incomplete) => self.relay.extend_from_slice(&self.scratch[..n]),
                Ok(Feed::Complete(used)) => {
                    if used < n {
                        tracing::debug!(extra = n - used, "Discarding bytes after response end");
                    }
                    self.relay.extend_from_slice(&self.scratch[..used]);
                    self.response_complete = true;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Invalid backend response");
                    return Progress::Finished(ForwardStatus::IoError);
                }
            }
        }

        if self.response_complete && self.relay.is_empty() {
            return Progress::Finished(ForwardStatus::Success);
        }

        Progress::Wait(Wait {
            backend_read: !self.response_complete && self.relay.is_empty(),
            backend_write: !self.body_done(),
            client_write: !self.relay.is_empty(),
        })
    }

    fn send_header(&mut self) -> io::Result<bool> {
        let conn = self.conn.as_ref().ok_or_else(not_connected)?;
        self.header.send(conn, &self.request.head)
    }

    fn send_body(&mut self) -> io::Result<bool> {
        let conn = self.conn.as_ref().ok_or_else(not_connected)?;
        self.body.send(conn, &self.request.body)
    }

    /// `Ok(None)` when the backend has nothing ready.
    fn read_backend(&mut self) -> io::Result<Option<usize>> {
        let conn = self.conn.as_ref().ok_or_else(not_connected)?;
        loop {
            match conn.try_read(&mut self.scratch) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// `Ok(true)` once the relay buffer is empty.
    fn flush_relay<T: Transport + ?Sized>(&mut self, client: &T) -> io::Result<bool> {
        while !self.relay.is_empty() {
            match client.try_write(&self.relay) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.relay.advance(n);
                    self.relayed += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "forward has no backend connection")
}
