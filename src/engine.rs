//! The connection engine (§4.3): the public `Engine` handle, the
//! background connection task, mode rules, and inbound reply dispatch.
//!
//! Grounded on two teacher files fused together: `mini-redis::conn::
//! Connection` for the buffered read/write shape over a transport, and
//! `mini-redis::pool`'s actor pattern (an `mpsc::Sender<Command>` handle
//! backed by a task that owns the real connection, pairing every request
//! with a `oneshot::Sender` for its reply) generalized from "one typed
//! `Command` variant per Redis command" to "one opaque `execute_command`
//! call plus a handful of control-plane variants for subscriptions and
//! transactions".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{ConnectOptions, RedisEngineError, Result};
use crate::io::Transport;
use crate::parser::Parser;
use crate::pending::{PendingQueue, PendingRequest, Purpose};
use crate::state::ConnectionState;
use crate::subscription::{Message, SubscriptionHandle, SubscriptionKind, SubscriptionRegistry};
use crate::transaction::Transaction;
use crate::wire::{encode_command, Reply};

/// Commands in the reserved subscription-safe set (§4.3 rule 1): allowed
/// regardless of `PubSub` mode.
const PUBSUB_SAFE: &[&str] = &["SUBSCRIBE", "PSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE", "PING", "QUIT"];

enum EngineCommand {
    Execute {
        name: String,
        args: Vec<Bytes>,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Subscribe {
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
        reply: oneshot::Sender<Result<Vec<SubscriptionHandle>>>,
    },
    Unsubscribe {
        kind: SubscriptionKind,
        channels: Vec<Bytes>,
        reply: oneshot::Sender<Result<()>>,
    },
    BeginTransaction {
        reply: oneshot::Sender<Result<Reply>>,
    },
    QueueInTransaction {
        name: String,
        args: Vec<Bytes>,
        reply: oneshot::Sender<Result<oneshot::Receiver<Result<Reply>>>>,
    },
    ExecTransaction {
        reply: oneshot::Sender<Result<Reply>>,
    },
    DiscardTransaction {
        reply: oneshot::Sender<Result<Reply>>,
    },
    RegisterDisconnectWaiter(oneshot::Sender<()>),
    SubscribeMessageBus(oneshot::Sender<broadcast::Receiver<Message>>),
}

/// A cheaply-cloneable handle to one RESP2 connection's background task.
///
/// Mirrors `mini-redis::pool::Pool`/`Connection`'s split: the handle
/// itself touches no connection state directly, it only has a sender
/// half of the command channel. All mutable state (pending queue,
/// subscription maps, parser, `ConnectionState`) lives exclusively inside
/// the spawned `run_connection` task (§5).
#[derive(Clone)]
pub struct Engine {
    command_tx: mpsc::Sender<EngineCommand>,
    pipeline_depth: Arc<AtomicUsize>,
}

impl Engine {
    /// Drives a connection over `transport`. Spawns the background task
    /// and performs the `AUTH` handshake (if `opts.auth` is set) before
    /// resolving, matching §4.3's `connect` contract: the connection only
    /// reaches `Ready` once `AUTH`'s reply is `+OK`.
    pub async fn connect<T: Transport>(transport: T, opts: ConnectOptions) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let pipeline_depth = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_connection(transport, command_rx, opts, ready_tx, pipeline_depth.clone()));

        ready_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))?;
        Ok(Engine { command_tx, pipeline_depth })
    }

    /// Convenience over [`Engine::connect`] that dials a TCP socket first.
    pub async fn connect_tcp(opts: ConnectOptions) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        Self::connect(stream, opts).await
    }

    /// The central primitive (§4.3, §6): sends `name`/`args` and resolves
    /// with the server's reply. `SUBSCRIBE`/`PSUBSCRIBE`/`UNSUBSCRIBE`/
    /// `PUNSUBSCRIBE` are routed through the subscription registry instead
    /// of the pending queue (rule 4) — callers who want the resulting
    /// `SubscriptionHandle`s should use [`Engine::subscribe`] and friends
    /// instead of this primitive directly.
    #[tracing::instrument(skip(self, args))]
    pub async fn execute_command(&self, name: &str, args: &[Bytes]) -> Result<Reply> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "SUBSCRIBE" => {
                self.subscribe(args.to_vec()).await?;
                return Ok(Reply::SimpleString(Bytes::from_static(b"OK")));
            }
            "PSUBSCRIBE" => {
                self.psubscribe(args.to_vec()).await?;
                return Ok(Reply::SimpleString(Bytes::from_static(b"OK")));
            }
            "UNSUBSCRIBE" => {
                self.unsubscribe(args.to_vec()).await?;
                return Ok(Reply::SimpleString(Bytes::from_static(b"OK")));
            }
            "PUNSUBSCRIBE" => {
                self.punsubscribe(args.to_vec()).await?;
                return Ok(Reply::SimpleString(Bytes::from_static(b"OK")));
            }
            _ => {}
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Execute {
                name: name.to_string(),
                args: args.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))
    }

    /// Subscribes to `channels`, returning one handle per channel not
    /// already subscribed to on this connection (§4.4).
    pub async fn subscribe(&self, channels: Vec<Bytes>) -> Result<Vec<SubscriptionHandle>> {
        self.subscribe_kind(SubscriptionKind::Channel, channels).await
    }

    /// Subscribes to `patterns` via `PSUBSCRIBE`.
    pub async fn psubscribe(&self, patterns: Vec<Bytes>) -> Result<Vec<SubscriptionHandle>> {
        self.subscribe_kind(SubscriptionKind::Pattern, patterns).await
    }

    async fn subscribe_kind(&self, kind: SubscriptionKind, names: Vec<Bytes>) -> Result<Vec<SubscriptionHandle>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Subscribe { kind, channels: names, reply: reply_tx })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))
    }

    /// Unsubscribes from `channels`, or from every subscribed channel if
    /// `channels` is empty.
    pub async fn unsubscribe(&self, channels: Vec<Bytes>) -> Result<()> {
        self.unsubscribe_kind(SubscriptionKind::Channel, channels).await
    }

    /// `PUNSUBSCRIBE` counterpart of [`Engine::unsubscribe`].
    pub async fn punsubscribe(&self, patterns: Vec<Bytes>) -> Result<()> {
        self.unsubscribe_kind(SubscriptionKind::Pattern, patterns).await
    }

    async fn unsubscribe_kind(&self, kind: SubscriptionKind, names: Vec<Bytes>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::Unsubscribe { kind, channels: names, reply: reply_tx })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))
    }

    /// Opens a transaction (§4.5): issues `MULTI` and, once acknowledged,
    /// returns a scoped [`Transaction`] handle.
    pub async fn multi(&self) -> Result<Transaction<'_>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::BeginTransaction { reply: reply_tx })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        match reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))? {
            Reply::SimpleString(ref s) if s.as_ref() == b"OK" => Ok(Transaction::new(self)),
            other => Err(other.into_engine_error().unwrap_or_else(|| {
                RedisEngineError::protocol_misuse("MULTI did not return OK")
            })),
        }
    }

    pub(crate) async fn queue_in_transaction(&self, name: &str, args: &[Bytes]) -> Result<oneshot::Receiver<Result<Reply>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::QueueInTransaction {
                name: name.to_string(),
                args: args.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))?
    }

    pub(crate) async fn exec_transaction(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::ExecTransaction { reply: reply_tx })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))?;
        Ok(())
    }

    pub(crate) async fn discard_transaction(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::DiscardTransaction { reply: reply_tx })
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.unwrap_or(Err(RedisEngineError::Disconnected))?;
        Ok(())
    }

    /// Best-effort `DISCARD`, for `Transaction::drop`. Cannot await a
    /// reply from `Drop`, so this only enqueues the request.
    pub(crate) fn discard_transaction_fire_and_forget(&self) {
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = self.command_tx.try_send(EngineCommand::DiscardTransaction { reply: reply_tx });
    }

    /// Current pending-queue length (§4.3 "Pipelining"). Advisory only;
    /// not enforced as backpressure (§9 Open Questions).
    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth.load(Ordering::Relaxed)
    }

    /// Resolves once the connection closes, cleanly or not (§4.3 "Close
    /// handling"). May be called any number of times.
    pub fn on_disconnect(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Err(TrySendError::Closed(EngineCommand::RegisterDisconnectWaiter(tx))) =
            self.command_tx.try_send(EngineCommand::RegisterDisconnectWaiter(tx))
        {
            let _ = tx.send(());
        }
        rx
    }

    /// Subscribes to the deprecated per-connection `message` event fan-out
    /// (§4.4's "shared event bus", §6's `on_message` observation hook):
    /// every routed `message`/`pmessage` is published here regardless of
    /// which (or whether any) [`SubscriptionHandle`] is also listening.
    #[deprecated(note = "use SubscriptionHandle::recv or its Stream impl instead")]
    pub async fn on_message_bus(&self) -> Result<broadcast::Receiver<Message>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(EngineCommand::SubscribeMessageBus(reply_tx))
            .await
            .map_err(|_| RedisEngineError::Disconnected)?;
        reply_rx.await.map_err(|_| RedisEngineError::Disconnected)
    }
}

fn is_pubsub_safe(upper_name: &str) -> bool {
    PUBSUB_SAFE.contains(&upper_name)
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, buf: &BytesMut) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// The background task driving one connection. Owns everything mutable
/// about the connection (§5): the transport halves, the parser, the
/// pending queue, the subscription registry, and `ConnectionState`.
async fn run_connection<T: Transport>(
    transport: T,
    mut command_rx: mpsc::Receiver<EngineCommand>,
    opts: ConnectOptions,
    ready: oneshot::Sender<Result<()>>,
    pipeline_depth: Arc<AtomicUsize>,
) {
    let (mut reader, writer) = tokio::io::split(transport);
    let mut writer = BufWriter::new(writer);
    let mut parser = Parser::new();
    let mut pending: PendingQueue = PendingQueue::new();
    let mut registry = SubscriptionRegistry::new();
    let mut state = ConnectionState::Connecting;
    let mut transaction_captures: Vec<oneshot::Sender<Result<Reply>>> = Vec::new();
    let mut disconnect_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut scratch = vec![0u8; 4 * 1024];

    if let Some(auth) = opts.auth.clone() {
        let mut buf = BytesMut::new();
        encode_command("AUTH", &[auth], &mut buf);
        if let Err(e) = write_frame(&mut writer, &buf).await {
            let _ = ready.send(Err(RedisEngineError::Io(e)));
            return;
        }
        match read_one(&mut reader, &mut parser, &mut scratch).await {
            Ok(Reply::SimpleString(ref s)) if s.as_ref() == b"OK" => {}
            Ok(other) => {
                let _ = ready.send(Err(other
                    .into_engine_error()
                    .unwrap_or_else(|| RedisEngineError::protocol_misuse("AUTH rejected"))));
                return;
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
    }
    state = ConnectionState::Ready;
    if ready.send(Ok(())).is_err() {
        return;
    }

    let disconnect_err = 'main: loop {
        tokio::select! {
            biased;

            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break 'main RedisEngineError::Disconnected };
                if let Err(e) = handle_engine_command(
                    cmd,
                    &mut writer,
                    &mut state,
                    &mut pending,
                    &mut registry,
                    &mut transaction_captures,
                    &mut disconnect_waiters,
                    &pipeline_depth,
                ).await {
                    break 'main e;
                }
            }

            read_result = reader.read(&mut scratch) => {
                match read_result {
                    Ok(0) => break 'main RedisEngineError::Disconnected,
                    Ok(n) => {
                        let replies = parser.feed(&scratch[..n]);
                        let mut fatal = None;
                        for reply in replies {
                            match reply {
                                Ok(reply) => {
                                    if let Err(e) = dispatch_inbound(
                                        reply,
                                        &mut state,
                                        &mut pending,
                                        &mut registry,
                                        &mut transaction_captures,
                                        &pipeline_depth,
                                    ) {
                                        fatal = Some(e);
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "fatal framing error");
                                    fatal = Some(e);
                                    break;
                                }
                            }
                        }
                        if let Some(e) = fatal {
                            break 'main e;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "transport read error");
                        break 'main RedisEngineError::Io(e);
                    }
                }
            }
        }
    };

    close_connection(disconnect_err, pending, registry, transaction_captures, disconnect_waiters);
}

/// Reads from the transport until the parser yields exactly one reply.
/// Used only for the synchronous `AUTH` handshake before the main
/// `select!` loop starts.
async fn read_one<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    parser: &mut Parser,
    scratch: &mut [u8],
) -> Result<Reply> {
    loop {
        let n = reader.read(scratch).await?;
        if n == 0 {
            return Err(RedisEngineError::Disconnected);
        }
        for reply in parser.feed(&scratch[..n]) {
            return reply;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_engine_command<W: tokio::io::AsyncWrite + Unpin>(
    cmd: EngineCommand,
    writer: &mut W,
    state: &mut ConnectionState,
    pending: &mut PendingQueue,
    registry: &mut SubscriptionRegistry,
    transaction_captures: &mut Vec<oneshot::Sender<Result<Reply>>>,
    disconnect_waiters: &mut Vec<oneshot::Sender<()>>,
    pipeline_depth: &Arc<AtomicUsize>,
) -> std::result::Result<(), RedisEngineError> {
    match cmd {
        EngineCommand::Execute { name, args, reply } => {
            let upper = name.to_ascii_uppercase();
            if state.is_pubsub() && !is_pubsub_safe(&upper) {
                let _ = reply.send(Err(RedisEngineError::protocol_misuse("pubsub mode")));
                return Ok(());
            }
            if matches!(state, ConnectionState::InTransaction) && upper == "MULTI" {
                let _ = reply.send(Err(RedisEngineError::protocol_misuse("nested transaction")));
                return Ok(());
            }
            pending.push_back(PendingRequest::new(describe(&name, &args), reply));
            pipeline_depth.store(pending.len(), Ordering::Relaxed);
            let mut buf = BytesMut::new();
            encode_command(&name, &args, &mut buf);
            if let Err(e) = write_frame(writer, &buf).await {
                return Err(RedisEngineError::Io(e));
            }
        }

        EngineCommand::Subscribe { kind, channels, reply } => {
            registry.begin_subscribe(kind, channels.clone(), reply);
            let name = if kind == SubscriptionKind::Pattern { "PSUBSCRIBE" } else { "SUBSCRIBE" };
            let mut buf = BytesMut::new();
            encode_command(name, &channels, &mut buf);
            if let Err(e) = write_frame(writer, &buf).await {
                return Err(RedisEngineError::Io(e));
            }
        }

        EngineCommand::Unsubscribe { kind, channels, reply } => {
            let resolved = registry.begin_unsubscribe(kind, channels, reply);
            // `begin_unsubscribe` already resolved the caller when there was
            // nothing subscribed of this kind; writing `UNSUBSCRIBE` with no
            // channel args would still get a reply (a nil-channel ack) with
            // no waiter expecting it, which falls through to the pending
            // queue and fatally desyncs the connection on otherwise-valid
            // input. Nothing to send in that case.
            if !resolved.is_empty() {
                let name = if kind == SubscriptionKind::Pattern { "PUNSUBSCRIBE" } else { "UNSUBSCRIBE" };
                let mut buf = BytesMut::new();
                encode_command(name, &resolved, &mut buf);
                if let Err(e) = write_frame(writer, &buf).await {
                    return Err(RedisEngineError::Io(e));
                }
            }
        }

        EngineCommand::BeginTransaction { reply } => {
            if matches!(state, ConnectionState::InTransaction) {
                let _ = reply.send(Err(RedisEngineError::protocol_misuse("nested transaction")));
                return Ok(());
            }
            transaction_captures.clear();
            pending.push_back(PendingRequest::tagged("MULTI".to_string(), reply, Purpose::Multi));
            pipeline_depth.store(pending.len(), Ordering::Relaxed);
            let mut buf = BytesMut::new();
            encode_command("MULTI", &[], &mut buf);
            if let Err(e) = write_frame(writer, &buf).await {
                return Err(RedisEngineError::Io(e));
            }
        }

        EngineCommand::QueueInTransaction { name, args, reply } => {
            if !matches!(state, ConnectionState::InTransaction) {
                let _ = reply.send(Err(RedisEngineError::protocol_misuse("QUEUE called outside MULTI")));
                return Ok(());
            }
            let (ack_tx, _ack_rx) = oneshot::channel();
            let (captured_tx, captured_rx) = oneshot::channel();
            pending.push_back(PendingRequest::new(format!("{name} (queued)"), ack_tx));
            pipeline_depth.store(pending.len(), Ordering::Relaxed);
            transaction_captures.push(captured_tx);
            let mut buf = BytesMut::new();
            encode_command(&name, &args, &mut buf);
            if let Err(e) = write_frame(writer, &buf).await {
                let _ = reply.send(Err(RedisEngineError::Disconnected));
                return Err(RedisEngineError::Io(e));
            }
            let _ = reply.send(Ok(captured_rx));
        }

        EngineCommand::ExecTransaction { reply } => {
            if !matches!(state, ConnectionState::InTransaction) {
                let _ = reply.send(Err(RedisEngineError::protocol_misuse("EXEC outside MULTI")));
                return Ok(());
            }
            pending.push_back(PendingRequest::tagged("EXEC".to_string(), reply, Purpose::Exec));
            pipeline_depth.store(pending.len(), Ordering::Relaxed);
            let mut buf = BytesMut::new();
            encode_command("EXEC", &[], &mut buf);
            if let Err(e) = write_frame(writer, &buf).await {
                return Err(RedisEngineError::Io(e));
            }
        }

        EngineCommand::DiscardTransaction { reply } => {
            if !matches!(state, ConnectionState::InTransaction) {
                let _ = reply.send(Err(RedisEngineError::protocol_misuse("DISCARD outside MULTI")));
                return Ok(());
            }
            pending.push_back(PendingRequest::tagged("DISCARD".to_string(), reply, Purpose::Discard));
            pipeline_depth.store(pending.len(), Ordering::Relaxed);
            let mut buf = BytesMut::new();
            encode_command("DISCARD", &[], &mut buf);
            if let Err(e) = write_frame(writer, &buf).await {
                return Err(RedisEngineError::Io(e));
            }
        }

        EngineCommand::RegisterDisconnectWaiter(tx) => {
            disconnect_waiters.push(tx);
        }

        EngineCommand::SubscribeMessageBus(tx) => {
            #[allow(deprecated)]
            let _ = tx.send(registry.message_bus());
        }
    }
    Ok(())
}

/// Routes one fully-decoded reply to the pending queue or the
/// subscription registry (§4.3 "Inbound dispatch").
fn dispatch_inbound(
    reply: Reply,
    state: &mut ConnectionState,
    pending: &mut PendingQueue,
    registry: &mut SubscriptionRegistry,
    transaction_captures: &mut Vec<oneshot::Sender<Result<Reply>>>,
    pipeline_depth: &Arc<AtomicUsize>,
) -> std::result::Result<(), RedisEngineError> {
    if let Some((kind, channel)) = pubsub_ack_tag(&reply) {
        if registry.has_subscribe_waiter(kind, channel) {
            let n = registry.handle_subscribe_ack(kind, channel);
            *state = if n == 0 { ConnectionState::Ready } else { ConnectionState::PubSub(n as u32) };
            return Ok(());
        }
    }
    if let Some((kind, channel)) = pubsub_unsub_tag(&reply) {
        if registry.has_unsubscribe_waiter(kind, channel) {
            let n = registry.handle_unsubscribe_ack(kind, channel);
            *state = if n == 0 { ConnectionState::Ready } else { ConnectionState::PubSub(n as u32) };
            return Ok(());
        }
    }
    if state.is_pubsub() {
        if let Some(()) = route_message(&reply, registry) {
            return Ok(());
        }
        // Not pubsub-shaped (e.g. PING's plain `+PONG`): fall through to
        // the ordinary pending queue below.
    }

    let req = pending.pop_front().ok_or_else(|| {
        RedisEngineError::protocol_misuse("reply received with an empty pending queue")
    })?;
    pipeline_depth.store(pending.len(), Ordering::Relaxed);

    match req.purpose {
        Purpose::Command => {
            let result = match &reply {
                Reply::Error(msg) => {
                    let msg = String::from_utf8_lossy(msg).into_owned();
                    Err(RedisEngineError::from_server_message(&msg))
                }
                _ => Ok(reply),
            };
            req.resolve(result);
        }
        Purpose::Multi => {
            if matches!(&reply, Reply::SimpleString(s) if s.as_ref() == b"OK") {
                *state = ConnectionState::InTransaction;
            }
            req.resolve(Ok(reply));
        }
        Purpose::Exec => {
            *state = ConnectionState::Ready;
            let captures = std::mem::take(transaction_captures);
            match &reply {
                Reply::Array(Some(items)) if items.len() == captures.len() => {
                    for (tx, item) in captures.into_iter().zip(items.iter().cloned()) {
                        let result = match item {
                            Reply::Error(ref msg) => {
                                let msg = String::from_utf8_lossy(msg).into_owned();
                                Err(RedisEngineError::from_server_message(&msg))
                            }
                            other => Ok(other),
                        };
                        let _ = tx.send(result);
                    }
                }
                _ => {
                    for tx in captures {
                        let _ = tx.send(Err(RedisEngineError::TransactionAborted));
                    }
                }
            }
            req.resolve(Ok(reply));
        }
        Purpose::Discard => {
            *state = ConnectionState::Ready;
            for tx in std::mem::take(transaction_captures) {
                let _ = tx.send(Err(RedisEngineError::TransactionAborted));
            }
            req.resolve(Ok(reply));
        }
    }
    Ok(())
}

fn route_message(reply: &Reply, registry: &mut SubscriptionRegistry) -> Option<()> {
    let items = match reply {
        Reply::Array(Some(items)) if items.len() >= 3 => items,
        _ => return None,
    };
    let tag = bulk_or_simple_bytes(&items[0])?;
    match tag.to_ascii_lowercase().as_slice() {
        b"message" if items.len() == 3 => {
            let channel = bulk_or_simple_bytes(&items[1])?;
            let payload = bulk_or_simple_bytes(&items[2])?;
            registry.route_message(Bytes::copy_from_slice(&channel), Bytes::copy_from_slice(&payload));
            Some(())
        }
        b"pmessage" if items.len() == 4 => {
            let pattern = bulk_or_simple_bytes(&items[1])?;
            let channel = bulk_or_simple_bytes(&items[2])?;
            let payload = bulk_or_simple_bytes(&items[3])?;
            registry.route_pmessage(
                Bytes::copy_from_slice(&pattern),
                Bytes::copy_from_slice(&channel),
                Bytes::copy_from_slice(&payload),
            );
            Some(())
        }
        _ => None,
    }
}

/// Recognises a `subscribe`/`psubscribe` ack: `[tag, channel, count]`.
fn pubsub_ack_tag(reply: &Reply) -> Option<(SubscriptionKind, &[u8])> {
    let items = match reply {
        Reply::Array(Some(items)) if items.len() == 3 => items,
        _ => return None,
    };
    let tag = bulk_or_simple_bytes(&items[0])?;
    let kind = match tag.to_ascii_lowercase().as_slice() {
        b"subscribe" => SubscriptionKind::Channel,
        b"psubscribe" => SubscriptionKind::Pattern,
        _ => return None,
    };
    let channel = bulk_or_simple_bytes(&items[1])?;
    Some((kind, channel))
}

/// Recognises an `unsubscribe`/`punsubscribe` ack: `[tag, channel, count]`.
fn pubsub_unsub_tag(reply: &Reply) -> Option<(SubscriptionKind, &[u8])> {
    let items = match reply {
        Reply::Array(Some(items)) if items.len() == 3 => items,
        _ => return None,
    };
    let tag = bulk_or_simple_bytes(&items[0])?;
    let kind = match tag.to_ascii_lowercase().as_slice() {
        b"unsubscribe" => SubscriptionKind::Channel,
        b"punsubscribe" => SubscriptionKind::Pattern,
        _ => return None,
    };
    let channel = bulk_or_simple_bytes(&items[1])?;
    Some((kind, channel))
}

fn bulk_or_simple_bytes(reply: &Reply) -> Option<&[u8]> {
    match reply {
        Reply::BulkString(Some(b)) => Some(b.as_ref()),
        Reply::SimpleString(b) => Some(b.as_ref()),
        _ => None,
    }
}

fn describe(name: &str, args: &[Bytes]) -> String {
    format!("{name} ({} args)", args.len())
}

fn close_connection(
    err: RedisEngineError,
    mut pending: PendingQueue,
    mut registry: SubscriptionRegistry,
    transaction_captures: Vec<oneshot::Sender<Result<Reply>>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
) {
    tracing::warn!(error = %err, "connection closed");
    while let Some(req) = pending.pop_front() {
        req.resolve(Err(RedisEngineError::Disconnected));
    }
    for tx in transaction_captures {
        let _ = tx.send(Err(RedisEngineError::Disconnected));
    }
    registry.close_all();
    for tx in disconnect_waiters {
        let _ = tx.send(());
    }
}
