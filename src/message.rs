//! The hand-off unit between followers and workers.

use crate::{connection::Connection, handler::Payload};
use std::sync::Arc;

/// Pairs a decoded request (and, eventually, its encoded response) with the
/// connection that originated it.
///
/// Constructing a `Message` clones the owning `Arc<Connection>`; dropping it
/// drops that clone. This *is* the reference-counted draining protocol: as
/// long as a `Message` is alive, the connection's `Arc` strong count is at
/// least 2 (the registry's own reference plus this one). `close_connection`
/// removes the registry's reference and deregisters the socket immediately,
/// but the underlying `TcpStream` is only actually dropped — and the fd only
/// actually closed — once every `Message` still holding a clone has finished
/// and been dropped. No explicit finalize step is needed: it falls out of
/// ordinary `Arc`/`Drop` semantics.
pub struct Message {
    connection: Arc<Connection>,
    origin: usize,
    request: Option<Payload>,
    response: Option<Payload>,
}

impl Message {
    pub(crate) fn new(connection: Arc<Connection>, origin: usize, request: Option<Payload>) -> Self {
        Self {
            connection,
            origin,
            request,
            response: None,
        }
    }

    /// The connection this message belongs to.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Index of the follower this message must return to once processed.
    pub(crate) fn origin(&self) -> usize {
        self.origin
    }

    /// The decoded request, if any (absent for messages built by
    /// `Server::send_message`).
    pub fn request(&self) -> Option<&Payload> {
        self.request.as_ref()
    }

    /// Take ownership of the request payload, leaving `None` behind.
    pub fn take_request(&mut self) -> Option<Payload> {
        self.request.take()
    }

    /// The response payload attached by `process`, if any.
    pub fn response(&self) -> Option<&Payload> {
        self.response.as_ref()
    }

    /// Attach a response payload, to be encoded and written on the owning
    /// follower.
    pub fn set_response(&mut self, payload: Payload) {
        self.response = Some(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use bytes::BytesMut;

    struct NoopHandler;
    impl Handler for NoopHandler {
        fn decode(&self, _src: &mut BytesMut) -> crate::Result<Option<Payload>> {
            Ok(None)
        }
        fn encode(&self, _dst: &mut BytesMut, _response: &Payload) {}
        fn process(&self, _message: &mut Message) {}
    }

    fn test_connection() -> Arc<Connection> {
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
    fn message_holds_the_connection_alive() {
        let conn = test_connection();
        assert_eq!(Arc::strong_count(&conn), 1);

        let message = Message::new(conn.clone(), 0, None);
        assert_eq!(Arc::strong_count(&conn), 2);

        drop(message);
        assert_eq!(Arc::strong_count(&conn), 1);
    }

    #[test]
    fn take_request_leaves_none_behind() {
        let conn = test_connection();
        let mut message = Message::new(conn, 0, Some(Box::new(7u32)));
        assert!(message.request().is_some());
        let taken = message.take_request().unwrap();
        assert_eq!(*taken.downcast::<u32>().unwrap(), 7);
        assert!(message.request().is_none());
        assert!(message.take_request().is_none());
    }
}
