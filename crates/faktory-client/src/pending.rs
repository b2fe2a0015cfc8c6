//! The pending-reply queue.
//!
//! A strict FIFO of continuations, one per command written to the socket
//! whose reply has not yet arrived.  Inbound frames resume the head; a
//! disconnect drains every entry in write order.  Only the connection
//! engine touches this queue, always from its own task, so no locking.

use std::collections::VecDeque;

use faktory_protocol::Frame;
use tokio::sync::oneshot;

use crate::error::ClientError;

/// The continuation for one in-flight command.
pub(crate) type ReplyTx = oneshot::Sender<Result<Frame, ClientError>>;

#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    queue: VecDeque<ReplyTx>,
}

impl PendingReplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Register a continuation.  Must be called in the same task step as
    /// the socket write so no inbound frame can interleave.
    pub(crate) fn push(&mut self, reply: ReplyTx) {
        self.queue.push_back(reply);
    }

    /// Resume the oldest entry with `reply`.  Returns `false` when the
    /// queue is empty — a desynchronized reply stream the caller must
    /// treat as fatal.
    pub(crate) fn resume_head(&mut self, reply: Result<Frame, ClientError>) -> bool {
        match self.queue.pop_front() {
            Some(tx) => {
                // A dropped receiver means the caller gave up waiting;
                // the FIFO correspondence is preserved regardless.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Resume every entry with `error`, oldest first, and empty the queue.
    pub(crate) fn drain(&mut self, error: &ClientError) {
        for tx in self.queue.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}
