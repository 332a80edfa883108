//! The pending queue (§3's `PendingRequest`, §4.3 "pending queue").
//!
//! Grounded on `mini-redis::pool`'s `(Command, oneshot::Sender<...>)` pairs
//! sent over an mpsc channel, generalized from "one slot per typed command"
//! to "one opaque slot per `execute_command` call", and collected into an
//! explicit FIFO (`VecDeque`) instead of relying on the mpsc channel itself
//! to provide ordering, since the engine also needs to inspect and drain the
//! queue on disconnect (§4.3 "Close handling").

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::wire::Reply;

/// What the background task does with a pending reply beyond resolving its
/// completion oneshot, once it reaches the head of the queue (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Purpose {
    /// An ordinary `execute_command` call.
    Command,
    /// `MULTI`: transitions the connection to `InTransaction` once its
    /// reply is a `+OK`.
    Multi,
    /// `EXEC`: transitions back to `Ready` and distributes the reply array
    /// index-for-index to the transaction's captured futures.
    Exec,
    /// `DISCARD`: transitions back to `Ready` and fails every captured
    /// future with `TransactionAborted`.
    Discard,
}

/// One in-flight request: written to the socket, waiting for its reply to
/// reach the head of the queue.
///
/// Cancellation (§5) is implemented as "mark-and-discard" for free: the
/// caller cancels by dropping the `oneshot::Receiver` half, which the
/// background task observes via `completion.is_closed()` before bothering
/// to build the result it would have sent.
pub(crate) struct PendingRequest {
    /// Human-readable command summary, used in `tracing` call sites.
    pub label: String,
    pub completion: oneshot::Sender<Result<Reply>>,
    pub purpose: Purpose,
}

impl PendingRequest {
    pub(crate) fn new(label: String, completion: oneshot::Sender<Result<Reply>>) -> Self {
        PendingRequest {
            label,
            completion,
            purpose: Purpose::Command,
        }
    }

    pub(crate) fn tagged(label: String, completion: oneshot::Sender<Result<Reply>>, purpose: Purpose) -> Self {
        PendingRequest { label, completion, purpose }
    }

    /// Resolves (or silently discards, if the caller cancelled) this
    /// request with `result`.
    pub(crate) fn resolve(self, result: Result<Reply>) {
        if self.completion.is_closed() {
            tracing::debug!(label = %self.label, "discarding reply for a cancelled request");
            return;
        }
        let _ = self.completion.send(result);
    }
}

/// FIFO of in-flight requests. In `Ready` state its length equals the
/// number of unanswered commands already written to the socket (§3
/// invariant).
pub(crate) type PendingQueue = VecDeque<PendingRequest>;
