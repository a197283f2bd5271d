//! Connection state machine and the registry that owns open connections.
//!
//! A connection is accepted into `AwaitingRequest`, may move to `Writing`
//! when the response does not fit the socket buffer in one go, and is
//! closed by removing it from the registry. Entries are keyed by slab
//! handles, never by socket identity.

use crate::handler::PendingResponse;
use slab::Slab;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Accepted and waiting for the query to arrive.
    AwaitingRequest,
    /// Response built, still being sent.
    Writing(PendingResponse),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Socket, or whatever the multiplexer uses to reach it.
    pub stream: S,
    /// Peer address, for logging only.
    pub peer: SocketAddr,
    pub state: ConnState,
}

impl<S> Connection<S> {
    /// Create a connection waiting for its request.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::AwaitingRequest,
        }
    }

    /// Transition to writing the rest of `response`.
    pub fn start_writing(&mut self, response: PendingResponse) {
        self.state = ConnState::Writing(response);
    }

    pub fn is_awaiting_request(&self) -> bool {
        matches!(self.state, ConnState::AwaitingRequest)
    }
}

/// Registry of open connections using slab allocation.
///
/// Owned by exactly one multiplexer. Removing an entry is the `Closed`
/// transition: the socket is released when the returned value drops.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Insert a connection built from its own handle.
    ///
    /// Returns `None` without calling `build` if the registry is at capacity.
    pub fn insert_with(&mut self, build: impl FnOnce(usize) -> Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        entry.insert(build(id));
        Some(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Number of connections still waiting for their request.
    pub fn awaiting_request(&self) -> usize {
        self.connections
            .iter()
            .filter(|(_, c)| c.is_awaiting_request())
            .count()
    }

    /// Remove every connection, returning them in handle order.
    pub fn drain(&mut self) -> Vec<Connection<S>> {
        self.connections.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut conn = Connection::new((), addr(1000));
        assert!(conn.is_awaiting_request());

        conn.start_writing(PendingResponse::new(Bytes::from_static(b"x: 0\n")));
        assert!(matches!(conn.state, ConnState::Writing(ref r) if r.len() == 5));
        assert!(!conn.is_awaiting_request());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(Connection::new(10, addr(1001))).unwrap();
        let id2 = registry.insert(Connection::new(11, addr(1002))).unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(Connection::new(12, addr(1003))).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(id1).unwrap().stream, 10);
        assert_eq!(registry.get_mut(id2).unwrap().peer, addr(1002));

        let removed = registry.remove(id1).unwrap();
        assert_eq!(removed.peer, addr(1001));
        assert!(registry.get_mut(id1).is_none());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let mut registry = ConnectionRegistry::new(4);
        let id = registry.insert_with(|id| Connection::new(id, addr(2000))).unwrap();
        assert_eq!(registry.get_mut(id).unwrap().stream, id);

        let mut full = ConnectionRegistry::<usize>::new(0);
        let mut called = false;
        assert!(full
            .insert_with(|id| {
                called = true;
                Connection::new(id, addr(2001))
            })
            .is_none());
        assert!(!called);
    }

    #[test]
    fn test_awaiting_request_count_and_drain() {
        let mut registry = ConnectionRegistry::new(4);
        registry.insert(Connection::new(1, addr(3000)));
        let id = registry.insert(Connection::new(2, addr(3001))).unwrap();
        registry
            .get_mut(id)
            .unwrap()
            .start_writing(PendingResponse::new(Bytes::from_static(b"a")));

        assert_eq!(registry.awaiting_request(), 1);
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
