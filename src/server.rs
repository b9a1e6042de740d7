//! Top-level orchestrator: owns configuration, the registry, and every
//! spawned thread.

use crate::connection::{Connection, TOKEN_CONN_WAKE, TOKEN_MSG_WAKE};
use crate::error::{Error, Result};
use crate::handler::{Handler, Payload};
use crate::io_thread::IoThread;
use crate::listener::Listener;
use crate::mailbox::{self, MailboxTx};
use crate::message::Message;
use crate::registry::Registry;
use crate::worker::WorkerPool;
use mio::{Poll, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Construction-time configuration for a [`Server`].
///
/// There is no config-file parsing here — spec.md names no such
/// requirement — but the shape (a plain struct assembled through a builder)
/// follows the same "explicit, validated construction" idiom the demo
/// binary's `clap` arguments use.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Total number of IO reactor threads, including the leader. Must be
    /// at least 1; with exactly 1, that single thread is both leader and
    /// follower (see the placement short-circuit in `io_thread`).
    pub io_threads: usize,
    /// Number of worker threads in the optional affinity pool. `None` means
    /// `Handler::process` runs inline on the owning follower.
    pub worker_threads: Option<usize>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    io_threads: Option<usize>,
    worker_threads: Option<usize>,
}

impl ServerConfigBuilder {
    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = Some(n);
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = Some(n);
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        let io_threads = self.io_threads.unwrap_or(1);
        if io_threads == 0 {
            return Err(Error::InvalidConfig("io_threads must be at least 1".into()));
        }
        if let Some(0) = self.worker_threads {
            return Err(Error::InvalidConfig("worker_threads must be at least 1 when set".into()));
        }
        Ok(ServerConfig {
            io_threads,
            worker_threads: self.worker_threads,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Running,
    Stopped,
}

struct PendingListen {
    addr: String,
    port: u16,
    handler: Arc<dyn Handler>,
}

/// The leader/follower reactor server.
///
/// Lifecycle: `init` -> zero or more `add_listen` -> `start` -> `run`
/// (blocks the calling thread) -> `stop` (called from elsewhere, e.g. a
/// signal handler thread). Dropping a still-running `Server` stops it, the
/// idiomatic replacement for an explicit `server_destroy` call.
pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
    pending: Vec<PendingListen>,
    state: Mutex<State>,
    running: Arc<AtomicBool>,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
    wakers: Vec<Arc<Waker>>,
    msg_txs: Vec<MailboxTx<Message>>,
    worker_pool: Mutex<Option<WorkerPool>>,
}

impl Server {
    /// Construct a server in the `Init` state. Mirrors the source's
    /// `xv_server_init`.
    pub fn init(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            pending: Vec::new(),
            state: Mutex::new(State::Init),
            running: Arc::new(AtomicBool::new(true)),
            handles: Mutex::new(None),
            wakers: Vec::new(),
            msg_txs: Vec::new(),
            worker_pool: Mutex::new(None),
        }
    }

    /// Register a listen endpoint and its handler. Must be called before
    /// `start`.
    pub fn add_listen(&mut self, addr: impl Into<String>, port: u16, handler: Arc<dyn Handler>) -> Result<()> {
        if *self.state.lock().unwrap() != State::Init {
            return Err(Error::AlreadyStarted);
        }
        self.pending.push(PendingListen {
            addr: addr.into(),
            port,
            handler,
        });
        Ok(())
    }

    /// Bind every registered listener and spawn all IO (and, if configured,
    /// worker) threads. Does not block; call `run` afterward to block the
    /// calling thread until `stop` is invoked.
    pub fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Init {
                return Err(Error::AlreadyStarted);
            }
            *state = State::Running;
        }

        let total = self.config.io_threads;

        let mut polls = Vec::with_capacity(total);
        let mut conn_txs = Vec::with_capacity(total);
        let mut conn_rxs = Vec::with_capacity(total);
        let mut msg_txs = Vec::with_capacity(total);
        let mut msg_rxs = Vec::with_capacity(total);
        let mut wakers = Vec::with_capacity(total);

        for _ in 0..total {
            let poll = Poll::new().map_err(Error::Io)?;
            let conn_waker = Arc::new(Waker::new(poll.registry(), TOKEN_CONN_WAKE).map_err(Error::Io)?);
            let msg_waker = Arc::new(Waker::new(poll.registry(), TOKEN_MSG_WAKE).map_err(Error::Io)?);
            let (conn_tx, conn_rx) = mailbox::channel::<Arc<Connection>>(conn_waker.clone());
            let (msg_tx, msg_rx) = mailbox::channel::<Message>(msg_waker);

            wakers.push(conn_waker);
            conn_txs.push(conn_tx);
            conn_rxs.push(conn_rx);
            msg_txs.push(msg_tx);
            msg_rxs.push(msg_rx);
            polls.push(poll);
        }

        let worker_pool = match self.config.worker_threads {
            Some(n) => Some(WorkerPool::new(n)),
            None => None,
        };
        let worker_handle = worker_pool.as_ref().map(|pool| pool.handle());

        let mut listeners = Vec::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            let listener = Listener::bind(&pending.addr, pending.port, pending.handler)?;
            listeners.push(listener);
        }

        let mut handles = Vec::with_capacity(total);
        // Consume the per-thread rx/tx vectors front-to-back via `.next()` so
        // indices stay aligned with `polls`/`wakers` without needing a second
        // Vec clone.
        let mut conn_rxs = conn_rxs.into_iter();
        let mut msg_rxs = msg_rxs.into_iter();
        let mut polls = polls.into_iter();
        for index in 0..total {
            let poll = polls.next().unwrap();
            let conn_rx = conn_rxs.next().unwrap();
            let msg_rx = msg_rxs.next().unwrap();
            let thread_listeners = if index == 0 { std::mem::take(&mut listeners) } else { Vec::new() };

            let io_thread = IoThread::new(
                index,
                total,
                poll,
                self.registry.clone(),
                conn_rx,
                conn_txs.clone(),
                msg_rx,
                msg_txs[index].clone(),
                worker_handle.clone(),
                thread_listeners,
                self.running.clone(),
            );

            let handle = std::thread::Builder::new()
                .name(format!("reactor-io-{index}"))
                .spawn(move || io_thread.run())
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        *self.handles.lock().unwrap() = Some(handles);
        *self.worker_pool.lock().unwrap() = worker_pool;
        self.wakers = wakers;
        self.msg_txs = msg_txs;

        Ok(())
    }

    /// Block the calling thread until `stop` is called (from another thread
    /// or a signal handler) and every IO thread has exited.
    pub fn run(&self) -> Result<()> {
        if *self.state.lock().unwrap() != State::Running {
            return Err(Error::NotStarted);
        }
        let handles = self.handles.lock().unwrap().take().ok_or(Error::NotStarted)?;
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Signal shutdown: quiesce the worker pool first (so every message
    /// already in flight is processed and returned), then wake every IO
    /// thread so its blocked `poll` call returns and it can observe the
    /// stopped flag and exit its loop.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Running {
                return Err(Error::NotStarted);
            }
            *state = State::Stopped;
        }

        self.running.store(false, Ordering::Release);

        if let Some(pool) = self.worker_pool.lock().unwrap().take() {
            pool.stop();
        }

        for waker in &self.wakers {
            let _ = waker.wake();
        }

        Ok(())
    }

    /// Hand a response payload to a connection without a corresponding
    /// inbound request, delivered on the connection's owning follower the
    /// same way a `process`-produced response would be.
    pub fn send_message(&self, conn: &Arc<Connection>, payload: Payload) -> Result<()> {
        if !conn.is_open() {
            return Err(Error::Closed);
        }
        let follower = conn.owning_follower();
        let tx = self.msg_txs.get(follower).ok_or(Error::Closed)?;
        let mut message = Message::new(conn.clone(), follower, None);
        message.set_response(payload);
        tx.send(message);
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if *self.state.lock().unwrap() == State::Running {
            let _ = self.stop();
            if let Some(handles) = self.handles.lock().unwrap().take() {
                for handle in handles {
                    let _ = handle.join();
                }
            }
        }
    }
}
