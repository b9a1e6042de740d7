//! Optional affinity-aware worker pool for `Handler::process`.
//!
//! No off-the-shelf thread-pool crate offers keyed affinity, and the
//! ordering invariant (messages from the same connection are processed in
//! the order they were read) requires exactly that: every task whose
//! connection hashes to worker `i` must be handed to worker `i`'s own queue,
//! never load-balanced across workers, or a second message from the same
//! connection could overtake the first.

use crate::connection::RawDescriptor;
use crate::mailbox::MailboxTx;
use crate::message::Message;
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;

enum Task {
    Process { message: Message, return_to: MailboxTx<Message> },
    Shutdown,
}

/// Cloneable handle to a running [`WorkerPool`]'s queues.
///
/// IO threads hold one of these (never the pool itself) so they can submit
/// work without owning the pool's join handles — only `Server` owns those,
/// via `WorkerPool::stop`.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    queues: Vec<Sender<Task>>,
}

impl WorkerHandle {
    fn queue_for(&self, fd: RawDescriptor) -> &Sender<Task> {
        let index = (fd as usize) % self.queues.len();
        &self.queues[index]
    }

    /// Enqueue `message` for processing; the result is returned to
    /// `return_to` (the originating follower's message mailbox) once
    /// `Handler::process` completes.
    ///
    /// Callers must not submit once `Server::stop` has begun tearing things
    /// down: `io_thread::IoThread::process_message` checks the shared
    /// `running` flag first and falls back to processing inline instead of
    /// calling this, so that a message never silently vanishes into an
    /// already-joined worker's queue.
    pub(crate) fn submit(&self, message: Message, return_to: MailboxTx<Message>) {
        let fd = message.connection().fd();
        let _ = self.queue_for(fd).send(Task::Process { message, return_to });
    }
}

/// A fixed-size pool of worker threads, each with its own FIFO queue.
pub(crate) struct WorkerPool {
    handle: WorkerHandle,
    join_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker pool requires at least one worker");
        let mut queues = Vec::with_capacity(worker_count);
        let mut join_handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx): (Sender<Task>, Receiver<Task>) = crossbeam_channel::unbounded();
            let handle = std::thread::Builder::new()
                .name(format!("reactor-worker-{index}"))
                .spawn(move || worker_loop(index, rx))
                .expect("failed to spawn worker thread");
            queues.push(tx);
            join_handles.push(handle);
        }

        Self {
            handle: WorkerHandle { queues },
            join_handles,
        }
    }

    pub(crate) fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Tell every worker to finish its queue and exit, then join all of
    /// them. Because each worker's queue is strict FIFO, this drains every
    /// already-submitted task to completion before returning — which is why
    /// `Server::stop` calls this before breaking any follower's event loop,
    /// after first flipping the shared `running` flag so followers stop
    /// handing off new work to submit.
    pub(crate) fn stop(self) {
        for queue in &self.handle.queues {
            let _ = queue.send(Task::Shutdown);
        }
        for handle in self.join_handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(index: usize, rx: Receiver<Task>) {
    tracing::debug!(worker = index, "worker thread started");
    while let Ok(task) = rx.recv() {
        match task {
            Task::Process { mut message, return_to } => {
                tracing::trace!(worker = index, origin = message.origin(), "processing message");
                let handler = message.connection().handler().clone();
                handler.process(&mut message);
                return_to.send(message);
            }
            Task::Shutdown => break,
        }
    }
    tracing::debug!(worker = index, "worker thread exiting");
}
