//! A single bound, listening TCP endpoint.

use crate::error::{Error, Result};
use crate::handler::Handler;
use mio::net::TcpListener as MioTcpListener;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;

/// Backlog depth passed to `listen(2)`. Matches the original's fixed value;
/// spec.md does not make this configurable and neither do we.
const LISTEN_BACKLOG: i32 = 1024;

/// One endpoint registered via `Server::add_listen`.
///
/// Every accepted connection on this listener is dispatched to `handler`.
/// The leader thread owns all listeners and is the only thread that ever
/// calls `accept` on them.
pub struct Listener {
    addr: String,
    port: u16,
    handler: Arc<dyn Handler>,
    pub(crate) inner: MioTcpListener,
}

impl Listener {
    pub(crate) fn bind(addr: &str, port: u16, handler: Arc<dyn Handler>) -> Result<Self> {
        let sock_addr: SocketAddr = format!("{addr}:{port}")
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid listen address {addr}:{port}")))?;

        let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, None).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            port,
            source,
        })?;
        socket.set_reuse_address(true).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            port,
            source,
        })?;
        socket.set_nonblocking(true).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            port,
            source,
        })?;
        socket.bind(&sock_addr.into()).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            port,
            source,
        })?;
        socket.listen(LISTEN_BACKLOG).map_err(|source| Error::Bind {
            addr: addr.to_string(),
            port,
            source,
        })?;

        let inner = MioTcpListener::from_std(socket.into());
        tracing::info!(%addr, port, "listening");

        Ok(Self {
            addr: addr.to_string(),
            port,
            handler,
            inner,
        })
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
