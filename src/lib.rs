//! A multi-threaded leader/follower TCP reactor runtime.
//!
//! One leader thread accepts connections and places them on one of `N - 1`
//! follower threads, each running its own `mio` event loop. An optional
//! affinity-aware worker pool can take `Handler::process` off the follower
//! threads while still preserving per-connection message order.

pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod server;

mod io_thread;
mod listener;
mod mailbox;
mod registry;
mod worker;

pub use connection::Connection;
pub use error::{Error, Result};
pub use handler::{Handler, Payload};
pub use listener::Listener;
pub use message::Message;
pub use server::{Server, ServerConfig, ServerConfigBuilder};
