//! Forward engine: owns the in-flight forwards of one worker.
//!
//! # Responsibilities
//! - Acquire forward contexts from the lookaside pool
//! - Select a backend and start the non-blocking connect
//! - Route readiness events to the right context
//! - Complete each forward exactly once and release its context
//!
//! # Design Decisions
//! - In-flight contexts are indexed by `ForwardId` and by client key in
//!   two hash indexes over node arenas
//! - A lookup miss means the event is stale; nothing else is touched
//! - Completion order: unlink, dispose of the backend connection, run the
//!   callback, release the pool slot

use std::fmt;
use std::sync::Arc;

use crate::forward::context::{BodyMode, Finished, Progress};
use crate::forward::{
    BackendConnector, Completion, ForwardContext, ForwardId, ForwardState, ForwardStatus, IoEvent, Step,
    Transport, Wait,
};
use crate::http::ProxyRequest;
use crate::index::{HashIndex, HashedKeys, IndexError, NodeArena, NodeStore};
use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::pool::{PoolHandle, Slot};
use crate::registry::BackendRegistry;

const MIN_INDEX_BUCKETS: usize = 16;
const MAX_INDEX_BUCKETS: usize = 4096;

/// Observer for state transitions.
pub type TransitionHook = Box<dyn FnMut(ForwardId, ForwardState)>;

type ContextPool<C> = PoolHandle<ForwardContext<<C as BackendConnector>::Conn>>;
type ContextSlot<C> = Slot<ForwardContext<<C as BackendConnector>::Conn>>;

pub struct ForwardEngine<C: BackendConnector> {
    pool: ContextPool<C>,
    live: HashIndex<HashedKeys>,
    live_nodes: NodeArena<ForwardId, ContextSlot<C>>,
    clients: HashIndex<HashedKeys>,
    client_nodes: NodeArena<ConnectionId, ForwardId>,
    registry: Arc<BackendRegistry>,
    connector: C,
    relay_chunk: usize,
    hook: Option<TransitionHook>,
}

impl<C: BackendConnector> ForwardEngine<C> {
    pub fn new(
        pool: ContextPool<C>,
        registry: Arc<BackendRegistry>,
        connector: C,
        relay_chunk: usize,
    ) -> Result<Self, IndexError> {
        let buckets = pool
            .capacity()
            .next_power_of_two()
            .clamp(MIN_INDEX_BUCKETS, MAX_INDEX_BUCKETS);

        Ok(Self {
            pool,
            live: HashIndex::new(buckets, HashedKeys::default())?,
            live_nodes: NodeArena::new(),
            clients: HashIndex::new(buckets, HashedKeys::default())?,
            client_nodes: NodeArena::new(),
            registry,
            connector,
            relay_chunk,
            hook: None,
        })
    }

    /// Forward `request`, sending the whole body before awaiting the response.
    pub fn start_forward(&mut self, request: ProxyRequest, client: ConnectionId, callback: Completion) -> Step {
        self.start(request, client, callback, BodyMode::Sequential)
    }

    /// Forward `request` in post-receive mode: response bytes are relayed
    /// while the body is still going out.
    pub fn start_forward_body(&mut self, request: ProxyRequest, client: ConnectionId, callback: Completion) -> Step {
        self.start(request, client, callback, BodyMode::PostReceive)
    }

    fn start(&mut self, request: ProxyRequest, client: ConnectionId, callback: Completion, mode: BodyMode) -> Step {
        if self.clients.find(&self.client_nodes, &client).is_some() {
            tracing::warn!(client = %client, "Forward already in flight for client");
            return reject(callback, ForwardStatus::Busy);
        }

        let mut slot = match self.pool.acquire() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(client = %client, error = %e, "No forward context available");
                return reject(callback, ForwardStatus::AllocationFailure);
            }
        };

        let id = ForwardId {
            index: slot.index(),
            generation: slot.generation(),
        };
        slot.begin(request, client, callback, mode, self.relay_chunk);
        let selected = self.registry.select(&slot.request);
        self.link(id, client, slot);
        metrics::record_pool_in_use(self.pool.in_use());

        let backend = match selected {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(forward = %id, error = %e, "Backend selection failed");
                return self.complete(id, ForwardStatus::NoBackend);
            }
        };

        tracing::debug!(forward = %id, client = %client, backend = %backend.addr, ?mode, "Forward started");

        let conn = match self.connector.connect(backend.addr) {
            Ok(conn) => conn,
            Err(e) => {
                backend.record_failure();
                tracing::debug!(forward = %id, backend = %backend.addr, error = %e, "Backend connect failed");
                return self.complete(id, ForwardStatus::BackendUnreachable);
            }
        };

        if let Some(ctx) = self.context_mut(id) {
            ctx.connecting(backend.track(), conn);
        }
        self.fire_hook(id);
        Step::Pending {
            id,
            wait: Wait::BACKEND_WRITABLE,
        }
    }

    /// Deliver a readiness event. Events for finished forwards are `Stale`.
    pub fn handle(&mut self, id: ForwardId, event: IoEvent, client: &dyn Transport) -> Step {
        let Some(node) = self.live.find(&self.live_nodes, &id) else {
            tracing::trace!(forward = %id, ?event, "Stale event dropped");
            return Step::Stale;
        };
        if event == IoEvent::ClientClosed {
            tracing::debug!(forward = %id, "Client went away mid-forward");
            return self.complete(id, ForwardStatus::ClientDisconnected);
        }
        let ctx = &mut *self.live_nodes.node_mut(node).value;

        if ctx.state() == ForwardState::AwaitBackendConnect {
            if event != IoEvent::BackendWritable {
                return Step::Pending {
                    id,
                    wait: Wait::BACKEND_WRITABLE,
                };
            }
            let connected = match ctx.conn.as_ref() {
                Some(conn) => self.connector.finish_connect(conn),
                None => Err(std::io::ErrorKind::NotConnected.into()),
            };
            if let Err(e) = connected {
                if let Some(backend) = ctx.backend.as_ref() {
                    backend.record_failure();
                }
                tracing::debug!(forward = %id, error = %e, "Backend connect failed");
                return self.complete(id, ForwardStatus::BackendUnreachable);
            }
            ctx.connected();
        }

        match ctx.advance(client) {
            Progress::Wait(wait) => {
                self.fire_hook(id);
                Step::Pending { id, wait }
            }
            Progress::Finished(status) => self.complete(id, status),
        }
    }

    /// Cancel a live forward with `status`.
    pub fn abort(&mut self, id: ForwardId, status: ForwardStatus) -> Step {
        if self.live.find(&self.live_nodes, &id).is_none() {
            return Step::Stale;
        }
        tracing::debug!(forward = %id, %status, "Forward aborted");
        self.complete(id, status)
    }

    /// Cancel whatever forward the client has in flight.
    pub fn abort_client(&mut self, client: ConnectionId) -> Step {
        let Some(node) = self.clients.find(&self.client_nodes, &client) else {
            return Step::Stale;
        };
        let id = self.client_nodes.node(node).value;
        self.abort(id, ForwardStatus::ClientDisconnected)
    }

    /// The forward's deadline passed.
    pub fn expire(&mut self, id: ForwardId) -> Step {
        let status = match self.state(id) {
            None => return Step::Stale,
            Some(ForwardState::AwaitBackendConnect) => ForwardStatus::BackendUnreachable,
            Some(_) => ForwardStatus::IoError,
        };
        tracing::warn!(forward = %id, %status, "Forward timed out");
        if status == ForwardStatus::BackendUnreachable {
            if let Some(backend) = self.context(id).and_then(|ctx| ctx.backend.as_ref()) {
                backend.record_failure();
            }
        }
        self.complete(id, status)
    }

    pub fn state(&self, id: ForwardId) -> Option<ForwardState> {
        self.context(id).map(ForwardContext::state)
    }

    /// Bytes relayed to the client by a live forward.
    pub fn relayed_bytes(&self, id: ForwardId) -> Option<u64> {
        self.context(id).map(ForwardContext::relayed)
    }

    pub fn context(&self, id: ForwardId) -> Option<&ForwardContext<C::Conn>> {
        let node = self.live.find(&self.live_nodes, &id)?;
        Some(&*self.live_nodes.node(node).value)
    }

    /// Live forwards.
    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    pub fn pool(&self) -> &ContextPool<C> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn set_transition_hook(&mut self, hook: impl FnMut(ForwardId, ForwardState) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    /// Fail every live forward. Used when the worker stops.
    pub fn abort_all(&mut self, status: ForwardStatus) -> usize {
        let mut ids = Vec::with_capacity(self.live.len());
        self.live.for_each(&self.live_nodes, |_, id, _| ids.push(*id));
        for id in &ids {
            self.abort(*id, status);
        }
        ids.len()
    }

    fn context_mut(&mut self, id: ForwardId) -> Option<&mut ForwardContext<C::Conn>> {
        let node = self.live.find(&self.live_nodes, &id)?;
        Some(&mut *self.live_nodes.node_mut(node).value)
    }

    fn link(&mut self, id: ForwardId, client: ConnectionId, slot: ContextSlot<C>) {
        let node = self.live_nodes.alloc(id, slot);
        self.live.insert(&mut self.live_nodes, node);
        let node = self.client_nodes.alloc(client, id);
        self.clients.insert(&mut self.client_nodes, node);
    }

    fn unlink(&mut self, id: ForwardId) -> Option<ContextSlot<C>> {
        let node = self.live.find(&self.live_nodes, &id)?;
        self.live.delete(&mut self.live_nodes, &id);
        let (_, slot) = self.live_nodes.free(node)?;

        if let Some(client) = slot.client {
            let nodes = &mut self.client_nodes;
            let mut unlinked = Vec::with_capacity(1);
            self.clients.delete_with(nodes, &client, |n| unlinked.push(n));
            for n in unlinked {
                nodes.free(n);
            }
        }
        Some(slot)
    }

    fn fire_hook(&mut self, id: ForwardId) {
        let Some(node) = self.live.find(&self.live_nodes, &id) else {
            return;
        };
        let ctx = &mut *self.live_nodes.node_mut(node).value;
        match self.hook.as_mut() {
            Some(hook) => ctx.drain_transitions().for_each(|state| hook(id, state)),
            None => ctx.drain_transitions().for_each(drop),
        }
    }

    fn complete(&mut self, id: ForwardId, status: ForwardStatus) -> Step {
        let Some(mut slot) = self.unlink(id) else {
            return Step::Stale;
        };

        let Finished {
            callback,
            conn,
            backend,
            reusable,
            relayed,
        } = slot.finish(status);

        match self.hook.as_mut() {
            Some(hook) => slot.drain_transitions().for_each(|state| hook(id, state)),
            None => slot.drain_transitions().for_each(drop),
        }

        if let Some(backend) = &backend {
            match status {
                ForwardStatus::Success => backend.record_success(),
                ForwardStatus::IoError => backend.record_failure(),
                _ => {}
            }
            if let (Some(conn), true) = (conn, reusable) {
                self.connector.recycle(backend.addr, conn);
            }
        }
        drop(backend);

        tracing::debug!(forward = %id, %status, relayed, "Forward complete");
        metrics::record_forward(status);

        if let Some(callback) = callback {
            callback(status);
        }

        // A corrupt release is logged by the pool; the slot stays out of circulation.
        let _ = self.pool.release(slot);
        metrics::record_pool_in_use(self.pool.in_use());

        Step::Finished { status, relayed }
    }
}

impl<C: BackendConnector> ForwardEngine<C>
where
    C::Conn: Clone,
{
    /// The backend connection of a live forward, for readiness waits.
    pub fn backend_conn(&self, id: ForwardId) -> Option<C::Conn> {
        self.context(id).and_then(|ctx| ctx.conn.clone())
    }
}

impl<C: BackendConnector> Drop for ForwardEngine<C> {
    fn drop(&mut self) {
        let aborted = self.abort_all(ForwardStatus::IoError);
        if aborted > 0 {
            tracing::warn!(aborted, "Forward engine dropped with forwards in flight");
        }
    }
}

impl<C: BackendConnector> fmt::Debug for ForwardEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardEngine")
            .field("in_flight", &self.live.len())
            .field("pool_capacity", &self.pool.capacity())
            .field("backends", &self.registry.len())
            .field("relay_chunk", &self.relay_chunk)
            .finish_non_exhaustive()
    }
}

/// Fail a forward that never got a context.
fn reject(callback: Completion, status: ForwardStatus) -> Step {
    metrics::record_forward(status);
    callback(status);
    Step::Finished { status, relayed: 0 }
}
