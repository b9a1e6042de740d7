//! The fd-indexed connection table.
//!
//! Mirrors the original's growable slot array: connections are indexed by
//! descriptor, the backing `Vec` doubles in size on overflow, and freed slots
//! are left `None` for reuse rather than compacted.

use crate::connection::Connection;
use std::sync::{Arc, RwLock};

const INITIAL_CAPACITY: usize = 1024;

/// Connection table shared by the leader (writer) and every follower
/// (reader). The leader holds the write lock only for `insert`/`remove`;
/// followers take the read lock to look up a connection by descriptor on
/// every dispatched event.
pub(crate) struct Registry {
    slots: RwLock<Vec<Option<Arc<Connection>>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; INITIAL_CAPACITY]),
        }
    }

    /// Insert `conn` at index `fd`, growing (doubling, at minimum up to
    /// `fd + 1`) if necessary.
    pub(crate) fn insert(&self, fd: usize, conn: Arc<Connection>) {
        let mut slots = self.slots.write().unwrap();
        if fd >= slots.len() {
            let new_len = (slots.len().max(INITIAL_CAPACITY) * 2).max(fd + 1);
            slots.resize(new_len, None);
            tracing::debug!(new_len, "registry grown");
        }
        slots[fd] = Some(conn);
    }

    /// Remove and return the connection at `fd`, if any.
    pub(crate) fn remove(&self, fd: usize) -> Option<Arc<Connection>> {
        let mut slots = self.slots.write().unwrap();
        if fd >= slots.len() {
            return None;
        }
        slots[fd].take()
    }

    /// Look up the connection at `fd` without removing it.
    pub(crate) fn get(&self, fd: usize) -> Option<Arc<Connection>> {
        let slots = self.slots.read().unwrap();
        slots.get(fd).and_then(|slot| slot.clone())
    }

    /// All live connections, for the shutdown sweep.
    pub(crate) fn all(&self) -> Vec<Arc<Connection>> {
        self.slots.read().unwrap().iter().flatten().cloned().collect()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, Payload};
    use crate::message::Message;
    use bytes::BytesMut;

    struct NoopHandler;
    impl Handler for NoopHandler {
        fn decode(&self, _src: &mut BytesMut) -> crate::Result<Option<Payload>> {
            Ok(None)
        }
        fn encode(&self, _dst: &mut BytesMut, _response: &Payload) {}
        fn process(&self, _message: &mut Message) {}
    }

    /// A real, connected socket pair, just to give `Connection::new` something
    /// to own. The registry tests below exercise only the table, not IO.
    fn make_connection() -> Arc<Connection> {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let client = std::thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());
        let (std_stream, _) = std_listener.accept().unwrap();
        client.join().unwrap();
        std_stream.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(std_stream);
        Connection::new("127.0.0.1".into(), addr.port(), stream, Arc::new(NoopHandler))
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let registry = Registry::new();
        let conn = make_connection();
        registry.insert(5, conn.clone());
        assert!(registry.get(5).is_some());
        assert!(registry.get(6).is_none());
    }

    #[test]
    fn small_fd_insert_does_not_trigger_growth() {
        let registry = Registry::new();
        assert_eq!(registry.capacity(), INITIAL_CAPACITY);
        let conn = make_connection();
        registry.insert(5, conn);
        assert_eq!(registry.capacity(), INITIAL_CAPACITY);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let registry = Registry::new();
        let conn = make_connection();
        registry.insert(INITIAL_CAPACITY + 10, conn);
        assert!(registry.get(INITIAL_CAPACITY + 10).is_some());
    }

    #[test]
    fn remove_then_get_is_none() {
        let registry = Registry::new();
        let conn = make_connection();
        registry.insert(3, conn);
        assert!(registry.remove(3).is_some());
        assert!(registry.get(3).is_none());
        assert!(registry.remove(3).is_none());
    }

    #[test]
    fn slot_is_reused_after_removal() {
        let registry = Registry::new();
        let a = make_connection();
        let b = make_connection();
        registry.insert(7, a);
        registry.remove(7);
        registry.insert(7, b);
        assert!(registry.get(7).is_some());
    }
}
