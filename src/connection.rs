//! Per-client connection state.

use crate::handler::Handler;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

/// The raw OS descriptor backing a connection's socket. On Unix this is a
/// file descriptor; on Windows, a `SOCKET` handle. Either way it is what the
/// design calls "the descriptor" for placement hashing and registry
/// indexing.
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

fn descriptor_of(stream: &TcpStream) -> RawDescriptor {
    #[cfg(unix)]
    {
        stream.as_raw_fd()
    }
    #[cfg(windows)]
    {
        stream.as_raw_socket()
    }
}

/// Reserved mio tokens for the two cross-thread mailbox wakers. Connection
/// and listener tokens are derived from their descriptor, offset past these.
pub(crate) const TOKEN_CONN_WAKE: Token = Token(0);
pub(crate) const TOKEN_MSG_WAKE: Token = Token(1);
pub(crate) const TOKEN_OFFSET: usize = 2;

const STATUS_OPEN: u8 = 0;
const STATUS_CLOSED: u8 = 1;

/// Buffers and socket state mutated only by the owning follower.
pub(crate) struct ConnectionIo {
    pub(crate) stream: TcpStream,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    write_armed: bool,
    registry: Option<mio::Registry>,
}

/// A single accepted TCP connection.
///
/// Owned via `Arc`. The registry holds one clone, each in-flight `Message`
/// holds one more; `Arc::strong_count` realizes the reference-counted
/// draining protocol described in the design. A `Connection` is constructed
/// on the leader at accept time and is only ever read from or written to by
/// the single follower that ends up owning it.
pub struct Connection {
    addr: String,
    port: u16,
    fd: RawDescriptor,
    handler: Arc<dyn Handler>,
    follower: AtomicUsize,
    status: AtomicU8,
    io: Mutex<ConnectionIo>,
}

/// Sentinel stored in `follower` before a connection has been placed.
const UNPLACED: usize = usize::MAX;

impl Connection {
    pub(crate) fn new(addr: String, port: u16, stream: TcpStream, handler: Arc<dyn Handler>) -> Arc<Self> {
        let fd = descriptor_of(&stream);
        Arc::new(Self {
            addr,
            port,
            fd,
            handler,
            follower: AtomicUsize::new(UNPLACED),
            status: AtomicU8::new(STATUS_OPEN),
            io: Mutex::new(ConnectionIo {
                stream,
                read_buf: BytesMut::with_capacity(4 * 1024),
                write_buf: BytesMut::new(),
                write_armed: false,
                registry: None,
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fd(&self) -> RawDescriptor {
        self.fd
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.fd as usize + TOKEN_OFFSET)
    }

    pub(crate) fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn is_open(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_OPEN
    }

    /// Transition OPEN -> CLOSED. Returns `true` iff this call performed the
    /// transition (idempotence: a second call on an already-closed
    /// connection is a no-op and returns `false`).
    pub(crate) fn mark_closed(&self) -> bool {
        self.status
            .compare_exchange(STATUS_OPEN, STATUS_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn owning_follower(&self) -> usize {
        self.follower.load(Ordering::Acquire)
    }

    /// Record `follower` as the owner and arm the read registration on its
    /// loop. Called exactly once, by the follower itself (never by the
    /// leader reaching across loops — see the placement notes in
    /// `io_thread`).
    pub(crate) fn place(self: &Arc<Self>, follower: usize, registry: &mio::Registry) -> io::Result<()> {
        self.follower.store(follower, Ordering::Release);
        let mut io = self.io.lock().unwrap();
        registry.register(&mut io.stream, self.token(), Interest::READABLE)?;
        io.registry = Some(registry.try_clone()?);
        Ok(())
    }

    /// Arm the write-readiness registration in addition to read. A no-op if
    /// already armed.
    pub(crate) fn arm_write(&self) -> io::Result<()> {
        let mut io = self.io.lock().unwrap();
        if io.write_armed {
            return Ok(());
        }
        if let Some(registry) = &io.registry {
            registry.reregister(&mut io.stream, self.token(), Interest::READABLE | Interest::WRITABLE)?;
        }
        io.write_armed = true;
        Ok(())
    }

    /// Disarm the write-readiness registration, leaving read armed. A no-op
    /// if not currently armed.
    pub(crate) fn disarm_write(&self) -> io::Result<()> {
        let mut io = self.io.lock().unwrap();
        if !io.write_armed {
            return Ok(());
        }
        if let Some(registry) = &io.registry {
            registry.reregister(&mut io.stream, self.token(), Interest::READABLE)?;
        }
        io.write_armed = false;
        Ok(())
    }

    /// Stop both registrations. Safe to call from any thread (mio's
    /// `Registry` is `Send + Sync` precisely to allow this) and safe to call
    /// more than once.
    pub(crate) fn deregister(&self) {
        let mut io = self.io.lock().unwrap();
        if let Some(registry) = io.registry.take() {
            let _ = registry.deregister(&mut io.stream);
        }
    }

    /// Run `f` with exclusive access to the buffers and socket. Only ever
    /// called from the owning follower.
    pub(crate) fn with_io<R>(&self, f: impl FnOnce(&mut ConnectionIo) -> R) -> R {
        f(&mut self.io.lock().unwrap())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("fd", &self.fd)
            .field("open", &self.is_open())
            .field("follower", &self.owning_follower())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropping `ConnectionIo::stream` closes the underlying socket.
        // Because the registry and every `Message` hold this struct behind
        // an `Arc`, this runs exactly once, exactly when the last owner
        // (always the registry, per the draining protocol) lets go.
        tracing::trace!(fd = self.fd as i64, addr = %self.addr, port = self.port, "connection destroyed, socket closed");
    }
}
