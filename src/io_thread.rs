//! The reactor loop: one per thread, leader or follower.
//!
//! Thread 0 is the leader: it owns every `Listener` and is the only thread
//! that ever calls `accept`. Threads `1..total` are followers: each owns a
//! disjoint subset of connections, placed by `fd % (total - 1) + 1` (or, with
//! a single thread total, the leader places connections on itself — the
//! `total == 1` short-circuit below).

use crate::connection::{Connection, TOKEN_CONN_WAKE, TOKEN_MSG_WAKE, TOKEN_OFFSET};
use crate::listener::Listener;
use crate::mailbox::{MailboxRx, MailboxTx};
use crate::message::Message;
use crate::registry::Registry;
use crate::worker::WorkerHandle;
use bytes::Buf;
use mio::event::Event;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Token range reserved for listeners, picked far away from any fd-derived
/// connection token (`fd + TOKEN_OFFSET`) to avoid collisions.
const LISTENER_TOKEN_BASE: usize = usize::MAX / 2;

fn listener_token(index: usize) -> Token {
    Token(LISTENER_TOKEN_BASE + index)
}

/// Everything one reactor thread needs to run independently.
pub(crate) struct IoThread {
    index: usize,
    total: usize,
    poll: Poll,
    registry: Arc<Registry>,
    conn_rx: MailboxRx<Arc<Connection>>,
    conn_txs: Vec<MailboxTx<Arc<Connection>>>,
    msg_rx: MailboxRx<Message>,
    msg_tx: MailboxTx<Message>,
    worker_pool: Option<WorkerHandle>,
    listeners: Vec<Listener>,
    running: Arc<AtomicBool>,
}

impl IoThread {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        total: usize,
        poll: Poll,
        registry: Arc<Registry>,
        conn_rx: MailboxRx<Arc<Connection>>,
        conn_txs: Vec<MailboxTx<Arc<Connection>>>,
        msg_rx: MailboxRx<Message>,
        msg_tx: MailboxTx<Message>,
        worker_pool: Option<WorkerHandle>,
        listeners: Vec<Listener>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            total,
            poll,
            registry,
            conn_rx,
            conn_txs,
            msg_rx,
            msg_tx,
            worker_pool,
            listeners,
            running,
        }
    }

    fn is_leader(&self) -> bool {
        self.index == 0
    }

    pub(crate) fn run(mut self) {
        if self.is_leader() {
            tracing::debug!(thread = self.index, "I'am leader IO Thread");
            let registry = self.poll.registry();
            for (i, listener) in self.listeners.iter_mut().enumerate() {
                if let Err(err) = registry.register(&mut listener.inner, listener_token(i), Interest::READABLE) {
                    tracing::error!(%err, "failed to register listener with poll");
                }
            }
        } else {
            tracing::debug!(thread = self.index, "I'am follower IO Thread No.{}", self.index);
        }

        let mut events = Events::with_capacity(256);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(Duration::from_millis(10))) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(%err, "poll failed");
                break;
            }

            for event in events.iter() {
                self.handle_event(event);
            }

            if !self.running.load(Ordering::Acquire) {
                self.drain_message_mailbox();
                break;
            }
        }

        self.shutdown();
    }

    fn handle_event(&mut self, event: &Event) {
        match event.token() {
            TOKEN_CONN_WAKE => self.drain_connection_mailbox(),
            TOKEN_MSG_WAKE => self.drain_message_mailbox(),
            token if token.0 >= LISTENER_TOKEN_BASE => self.accept_on(token.0 - LISTENER_TOKEN_BASE),
            token => self.dispatch_io_event(token, event),
        }
    }

    // --- leader-only: accept ---------------------------------------------

    fn accept_on(&mut self, listener_index: usize) {
        loop {
            let (stream, peer) = match self.listeners[listener_index].inner.accept() {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    return;
                }
            };

            let handler = self.listeners[listener_index].handler().clone();
            let conn = Connection::new(peer.ip().to_string(), peer.port(), stream, handler.clone());

            let fd = conn.fd() as usize;
            self.registry.insert(fd, conn.clone());
            handler.on_connect(&conn);

            let target = self.placement_for(fd);
            tracing::debug!(fd, target, "placing new connection");
            if target == self.index {
                if let Err(err) = conn.place(self.index, self.poll.registry()) {
                    tracing::error!(%err, "failed to register new connection");
                }
            } else {
                self.conn_txs[target].send(conn);
            }
        }
    }

    /// `fd % (total - 1) + 1`, except when there is only one IO thread total,
    /// in which case it places connections on itself. This arithmetic
    /// short-circuit is load-bearing: preserved verbatim.
    fn placement_for(&self, fd: usize) -> usize {
        if self.total == 1 {
            self.index
        } else {
            (fd % (self.total - 1)) + 1
        }
    }

    // --- follower: connection mailbox -------------------------------------

    fn drain_connection_mailbox(&mut self) {
        for conn in self.conn_rx.drain() {
            if let Err(err) = conn.place(self.index, self.poll.registry()) {
                tracing::error!(%err, "failed to register placed connection");
            }
        }
    }

    // --- follower: message mailbox ----------------------------------------

    fn drain_message_mailbox(&mut self) {
        for message in self.msg_rx.drain() {
            self.handle_returned_message(message);
        }
    }

    fn handle_returned_message(&mut self, message: Message) {
        let conn = message.connection().clone();
        if !conn.is_open() {
            return;
        }
        if let Some(response) = message.response() {
            conn.with_io(|io| conn.handler().encode(&mut io.write_buf, response));
            if let Err(err) = self.try_write(&conn) {
                tracing::debug!(fd = conn.fd() as i64, %err, "write failed, closing connection");
                self.close_connection(&conn);
            }
        }
        // `message` drops here, releasing its `Arc<Connection>` clone. If the
        // connection was already closed (registry slot removed) and this was
        // the last outstanding reference, `Connection::drop` now runs and the
        // socket is actually closed.
    }

    // --- follower: socket readiness ----------------------------------------

    fn dispatch_io_event(&mut self, token: Token, event: &Event) {
        let fd = token.0 - TOKEN_OFFSET;
        let conn = match self.registry.get(fd) {
            Some(conn) => conn,
            None => return,
        };
        if !conn.is_open() {
            return;
        }

        if event.is_readable() {
            match self.on_connection_read(&conn) {
                Ok(true) => {
                    self.close_connection(&conn);
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::debug!(fd, %err, "read failed, closing connection");
                    self.close_connection(&conn);
                    return;
                }
            }
        }

        if event.is_writable() {
            if let Err(err) = self.on_connection_write(&conn) {
                tracing::debug!(fd, %err, "write failed, closing connection");
                self.close_connection(&conn);
                return;
            }
        }

        self.process_read_buffer(&conn);
    }

    /// Reads as much as is available. Returns `Ok(true)` on a clean peer
    /// shutdown (EOF with an empty read buffer going in), `Ok(false)` if more
    /// data may still follow.
    fn on_connection_read(&self, conn: &Arc<Connection>) -> io::Result<bool> {
        conn.with_io(|io| loop {
            io.read_buf.reserve(4 * 1024);
            let mut scratch = [0u8; 4096];
            match io.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    io.read_buf.extend_from_slice(&scratch[..n]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        })
    }

    fn on_connection_write(&self, conn: &Arc<Connection>) -> io::Result<()> {
        self.try_write(conn)
    }

    fn try_write(&self, conn: &Arc<Connection>) -> io::Result<()> {
        let drained = conn.with_io(|io| -> io::Result<bool> {
            while !io.write_buf.is_empty() {
                match io.stream.write(&io.write_buf) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                    Ok(n) => {
                        io.write_buf.advance(n);
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            Ok(true)
        })?;

        if drained {
            conn.disarm_write()?;
        } else {
            conn.arm_write()?;
        }
        Ok(())
    }

    /// Decode everything currently buffered, dispatching each decoded
    /// request either straight to `process` (no worker pool configured) or
    /// to the affinity worker pool.
    fn process_read_buffer(&mut self, conn: &Arc<Connection>) {
        loop {
            let decoded = conn.with_io(|io| conn.handler().decode(&mut io.read_buf));
            match decoded {
                Ok(Some(payload)) => {
                    let message = Message::new(conn.clone(), self.index, Some(payload));
                    self.process_message(message);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(fd = conn.fd() as i64, %err, "decode failed, closing connection");
                    self.close_connection(conn);
                    break;
                }
            }
        }
    }

    /// Submits to the worker pool, unless the server is already stopping —
    /// `WorkerPool::stop` is called before any follower's loop is allowed to
    /// break, but a follower can still be mid-poll when it does, so a late
    /// submission here would otherwise land on an already-joined pool with
    /// no worker left to pick it up. Falling back to inline processing keeps
    /// every decoded request answered instead of silently dropped.
    fn process_message(&mut self, message: Message) {
        let inline = self.worker_pool.is_none() || !self.running.load(Ordering::Acquire);
        if inline {
            let mut message = message;
            let handler = message.connection().handler().clone();
            handler.process(&mut message);
            self.handle_returned_message(message);
        } else {
            self.worker_pool.as_ref().unwrap().submit(message, self.msg_tx.clone());
        }
    }

    fn close_connection(&mut self, conn: &Arc<Connection>) {
        let fd = conn.fd() as usize;
        if let Some(removed) = self.registry.remove(fd) {
            if removed.mark_closed() {
                removed.deregister();
                removed.handler().on_disconnect(&removed);
                tracing::debug!(fd, "connection closed");
            }
        }
    }

    fn shutdown(&mut self) {
        if self.is_leader() {
            let registry = self.poll.registry();
            for listener in &mut self.listeners {
                let _ = registry.deregister(&mut listener.inner);
            }
        }
        for conn in self.registry.all() {
            if conn.owning_follower() == self.index {
                self.close_connection(&conn);
            }
        }
        tracing::debug!(thread = self.index, "io thread shut down");
    }
}
