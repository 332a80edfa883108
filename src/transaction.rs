//! The `MULTI`/`EXEC`/`DISCARD` transaction envelope (§4.5).
//!
//! Grounded on `mini-redis::pool`'s pattern of pairing a command with a
//! `oneshot::Sender` for its reply: each queued command gets one ordinary
//! pending-queue slot for its `QUEUED` ack (resolved the normal way, by
//! queue position) plus one extra "captured" oneshot that the engine holds
//! onto until `EXEC` arrives, at which point the reply array's i-th
//! element resolves the i-th captured sender.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::engine::Engine;
use crate::error::Result;
use crate::wire::Reply;

/// The eventual result of one command queued inside a transaction.
/// Resolves when the transaction's `EXEC` reply array arrives, or fails
/// with `TransactionAborted` if the transaction is discarded first.
pub struct QueuedReply {
    receiver: oneshot::Receiver<Result<Reply>>,
}

impl QueuedReply {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<Reply>>) -> Self {
        QueuedReply { receiver }
    }

    /// Awaits this command's result. Consumes the handle since a
    /// transaction result can only be read once.
    pub async fn result(self) -> Result<Reply> {
        self.receiver
            .await
            .unwrap_or(Err(crate::error::RedisEngineError::Disconnected))
    }
}

/// A `MULTI` in progress on `engine`. Only one transaction may be open on
/// a connection at a time (§3, `ConnectionState::InTransaction`).
///
/// Dropping this without calling `exec` or `discard` implicitly issues
/// `DISCARD` (§4.5): every captured `QueuedReply` still outstanding fails
/// with `TransactionAborted` and the connection returns to `Ready`.
pub struct Transaction<'e> {
    engine: &'e Engine,
    resolved: bool,
}

impl<'e> Transaction<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Transaction {
            engine,
            resolved: false,
        }
    }

    /// Queues `name`/`args` inside the transaction. The command's `QUEUED`
    /// acknowledgement is consumed internally like any other pending-queue
    /// reply; this returns a handle to the command's real result, only
    /// available once `exec` resolves.
    pub async fn queue(&mut self, name: &str, args: &[Bytes]) -> Result<QueuedReply> {
        let receiver = self.engine.queue_in_transaction(name, args).await?;
        Ok(QueuedReply::new(receiver))
    }

    /// Executes every queued command atomically.
    pub async fn exec(mut self) -> Result<()> {
        self.resolved = true;
        self.engine.exec_transaction().await
    }

    /// Explicitly discards the transaction. Equivalent to dropping the
    /// handle, but lets a caller await the server round-trip and observe
    /// errors from it.
    pub async fn discard(mut self) -> Result<()> {
        self.resolved = true;
        self.engine.discard_transaction().await
    }
}

impl<'e> Drop for Transaction<'e> {
    fn drop(&mut self) {
        if !self.resolved {
            self.engine.discard_transaction_fire_and_forget();
        }
    }
}
