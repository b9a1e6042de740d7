//! Cross-thread handoff queues paired with an edge-triggered wakeup.
//!
//! Used two ways: the leader places newly-accepted connections on a
//! follower's connection mailbox, and workers (or `Server::send_message`)
//! return finished messages to a follower's message mailbox. Both are the
//! same shape — an MPSC queue plus a `mio::Waker` so the receiving reactor
//! loop wakes promptly instead of polling.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::Waker;
use std::sync::Arc;

pub(crate) struct MailboxTx<T> {
    tx: Sender<T>,
    waker: Arc<Waker>,
}

impl<T> Clone for MailboxTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<T> MailboxTx<T> {
    /// Send `item` and wake the receiving loop. The waker is edge-triggered
    /// (mio coalesces repeated `wake()` calls into a single readiness event),
    /// so waking unconditionally on every send is the correct, cheap choice
    /// rather than trying to detect "was the queue empty."
    pub(crate) fn send(&self, item: T) {
        // An error here means the receiver end (and its owning follower
        // thread) is gone, which only happens during shutdown; dropping the
        // item is the right response.
        if self.tx.send(item).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

pub(crate) struct MailboxRx<T> {
    rx: Receiver<T>,
}

impl<T> MailboxRx<T> {
    /// Drain everything currently queued without blocking. Safe to call
    /// repeatedly; returns an empty `Vec` once drained.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        items
    }
}

/// Build a connected `(MailboxTx, MailboxRx)` pair backed by an unbounded
/// channel and the given waker.
pub(crate) fn channel<T>(waker: Arc<Waker>) -> (MailboxTx<T>, MailboxRx<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (MailboxTx { tx, waker }, MailboxRx { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};

    #[test]
    fn fifo_order_preserved() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = channel::<i32>(waker);
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.drain(), vec![1, 2, 3]);
    }

    #[test]
    fn drain_twice_is_empty() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = channel::<i32>(waker);
        tx.send(42);
        assert_eq!(rx.drain(), vec![42]);
        assert!(rx.drain().is_empty());
    }
}
