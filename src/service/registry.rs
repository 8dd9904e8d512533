use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CancelScope, CloseCause};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Active,
    IdleTimedOut,
    Cancelling,
    Closed,
}

/// What the server keeps about a live connection: its identity and a way to
/// cancel its pipeline. Never the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    scope: CancelScope,
    state: Arc<Mutex<PipelineState>>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, scope: CancelScope) -> Self {
        ConnectionHandle {
            id,
            remote_addr,
            scope,
            state: Arc::new(Mutex::new(PipelineState::Active)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub fn cancel(&self, cause: CloseCause) -> bool {
        self.scope.cancel(cause)
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// `Closed` is final.
    pub fn set_state(&self, state: PipelineState) {
        let mut current = self.state.lock();
        if *current != PipelineState::Closed {
            *current = state;
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote_addr: self.remote_addr,
            state: self.state(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub state: PipelineState,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    sealed: bool,
}

/// Live connections of a server, keyed by connection id.
///
/// Pipelines insert themselves when accepted and remove themselves once fully
/// closed. Once sealed, the registry refuses new entries, so a shutdown that
/// enumerates it cannot miss a connection accepted concurrently.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false`, leaving the registry untouched, once sealed.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        inner.connections.insert(handle.id(), handle);
        true
    }

    pub fn deregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.lock().connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.lock().connections.get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.inner.lock().connections.values().cloned().collect()
    }

    /// Seals the registry and returns the connections still registered.
    pub fn seal(&self) -> Vec<ConnectionHandle> {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        inner.connections.values().cloned().collect()
    }

    /// Seals the registry and removes every entry.
    pub fn seal_and_drain(&self) -> Vec<ConnectionHandle> {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        inner.connections.drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnectionId, root: &CancelScope) -> ConnectionHandle {
        let addr: SocketAddr = format!("127.0.0.1:{}", 40000 + id).parse().unwrap();
        ConnectionHandle::new(id, addr, root.child())
    }

    #[test]
    fn test_register_and_deregister() {
        let root = CancelScope::new();
        let registry = ConnectionRegistry::new();
        assert!(registry.register(handle(1, &root)));
        assert!(registry.register(handle(2, &root)));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.deregister(1).map(|h| h.id()), Some(1));
        assert!(registry.deregister(1).is_none());
        assert!(registry.get(2).is_some());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_sealed_registry_refuses_new_connections() {
        let root = CancelScope::new();
        let registry = ConnectionRegistry::new();
        registry.register(handle(1, &root));

        let live = registry.seal();
        assert_eq!(live.len(), 1);
        assert!(!registry.register(handle(2, &root)));
        // sealing keeps existing entries until they deregister
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_seal_and_drain_empties_registry() {
        let root = CancelScope::new();
        let registry = ConnectionRegistry::new();
        for id in 0..4 {
            registry.register(handle(id, &root));
        }
        let drained = registry.seal_and_drain();
        assert_eq!(drained.len(), 4);
        for handle in &drained {
            handle.cancel(CloseCause::Forced);
            assert!(handle.scope().is_aborted());
        }
        assert!(registry.is_empty());
        assert!(!root.is_stopped());
    }

    #[test]
    fn test_closed_state_is_final() {
        let root = CancelScope::new();
        let handle = handle(9, &root);
        assert_eq!(handle.state(), PipelineState::Active);
        handle.set_state(PipelineState::Closed);
        handle.set_state(PipelineState::Cancelling);
        assert_eq!(handle.info().state, PipelineState::Closed);
    }
}
