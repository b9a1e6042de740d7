//! The user-supplied protocol handler.
//!
//! A handler is registered once per listen endpoint and dispatched to for
//! every connection accepted on that endpoint. It plays the role a vtable of
//! function pointers would play in a C implementation; here that role is
//! filled by a trait object (`Arc<dyn Handler>`), the idiomatic Rust
//! realization of the same idea.

use crate::{connection::Connection, message::Message, Result};
use bytes::BytesMut;
use std::any::Any;
use std::sync::Arc;

/// An opaque request or response payload owned by a [`Message`].
///
/// Cleanup of a payload is ordinary `Drop` — the idiomatic stand-in for an
/// explicit `packet_cleanup` vtable entry.
pub type Payload = Box<dyn Any + Send>;

/// The per-listen-endpoint protocol handler: decode, encode, process and the
/// connect/disconnect lifecycle notifications.
pub trait Handler: Send + Sync + 'static {
    /// Attempt to extract one framed request from `src`.
    ///
    /// The tri-valued outcome of the design collapses onto `Result<Option<_>>`:
    /// `Ok(Some(payload))` is a complete frame, `Ok(None)` means not enough
    /// bytes have arrived yet (leave `src` untouched and wait for more),
    /// `Err(_)` means the bytes in `src` do not form a valid frame and the
    /// connection should be closed.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Payload>>;

    /// Append the encoded form of `response` to `dst`.
    fn encode(&self, dst: &mut BytesMut, response: &Payload);

    /// Apply user logic to a decoded request. Implementations read
    /// `message.request()` and call `message.set_response(..)` to produce a
    /// reply; a message with no response attached encodes to nothing and no
    /// write occurs.
    fn process(&self, message: &mut Message);

    /// Called on the leader, once per accepted connection, just before it is
    /// placed on its owning follower.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// Called on the owning follower exactly once, the first time a
    /// connection transitions to closed.
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}
}
