//! Subscription registry (§4.4): channel/pattern bookkeeping, pending
//! acknowledgement waiters, and message routing for pub/sub mode.
//!
//! Grounded on `mini-redis::db::Db`'s per-channel `broadcast::Sender<Bytes>`
//! fan-out (the server side of the same idea), generalized here to the
//! client side: instead of fanning one published message out to every
//! subscribed socket, the registry routes one inbound message to the one
//! local handle that asked for it.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use crate::error::{RedisEngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    PMessage,
}

/// A message delivered on a subscribed channel or pattern (§3).
///
/// `channel` is always the concrete channel the message was published on;
/// for pattern subscriptions, `pattern` additionally identifies which
/// pattern matched. This is a plain value, not a back-reference to the
/// handle or the engine — the "weak back-reference" the spec's Design Notes
/// call for is simply the absence of any reference at all, since nothing
/// here needs to reach back into the engine to be useful to a caller.
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub channel: Bytes,
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

/// The user-facing handle for one channel or pattern subscription.
///
/// Lives from the first `SUBSCRIBE`/`PSUBSCRIBE` acknowledgement until the
/// matching `UNSUBSCRIBE`/`PUNSUBSCRIBE` acknowledgement, at which point
/// its stream completes. The underlying channel tolerates exactly one
/// producer (the engine's background task) and one consumer (this handle).
pub struct SubscriptionHandle {
    pub channel: Bytes,
    pub kind: SubscriptionKind,
    stream: UnboundedReceiverStream<Message>,
}

impl SubscriptionHandle {
    fn new(channel: Bytes, kind: SubscriptionKind, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        SubscriptionHandle {
            channel,
            kind,
            stream: UnboundedReceiverStream::new(receiver),
        }
    }

    /// Waits for the next message on this subscription, or `None` once the
    /// subscription has been closed (by `UNSUBSCRIBE` or disconnect).
    pub async fn recv(&mut self) -> Option<Message> {
        use tokio_stream::StreamExt;
        self.stream.next().await
    }
}

impl Stream for SubscriptionHandle {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_next(cx)
    }
}

struct SubscriptionEntry {
    sender: mpsc::UnboundedSender<Message>,
}

/// Aggregates the per-channel acks belonging to a single `SUBSCRIBE`/
/// `PSUBSCRIBE` call so its caller gets back one `Vec<SubscriptionHandle>`
/// once every channel in the call has been acknowledged, in request order.
struct SubscribeBatch {
    remaining: usize,
    handles: Vec<Option<SubscriptionHandle>>,
    reply: Option<oneshot::Sender<Result<Vec<SubscriptionHandle>>>>,
}

/// Same idea for `UNSUBSCRIBE`/`PUNSUBSCRIBE`, which has no payload to
/// collect — just a "every channel in this call is now gone" signal.
struct UnsubscribeBatch {
    remaining: usize,
    reply: Option<oneshot::Sender<Result<()>>>,
}

enum SubscribeWaiter {
    /// A fresh subscription: fulfilled by handing the already-constructed
    /// handle for `index` back to the batch.
    New {
        batch: Arc<Mutex<SubscribeBatch>>,
        index: usize,
    },
    /// The channel/pattern was already subscribed to on this connection;
    /// the ack is consumed but no second handle is produced (a message
    /// sink tolerates exactly one consumer).
    AlreadySubscribed {
        batch: Arc<Mutex<SubscribeBatch>>,
        index: usize,
    },
}

/// Maps channel names and patterns to active subscriptions and the
/// waiters for their pending acknowledgements (§4.4).
pub(crate) struct SubscriptionRegistry {
    channels: HashMap<Bytes, SubscriptionEntry>,
    patterns: HashMap<Bytes, SubscriptionEntry>,
    subscribe_waiters: HashMap<(SubscriptionKind, Bytes), VecDeque<SubscribeWaiter>>,
    unsubscribe_waiters: HashMap<(SubscriptionKind, Bytes), VecDeque<Arc<Mutex<UnsubscribeBatch>>>>,
    /// Deprecated fan-out preserved for consumers that pre-date the
    /// per-channel handle API (§4.4).
    message_bus: broadcast::Sender<Message>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        let (message_bus, _) = broadcast::channel(1024);
        SubscriptionRegistry {
            channels: HashMap::new(),
            patterns: HashMap::new(),
            subscribe_waiters: HashMap::new(),
            unsubscribe_waiters: HashMap::new(),
            message_bus,
        }
    }

    pub(crate) fn total_subscriptions(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    /// Whether an inbound `(p)subscribe`/`(p)unsubscribe` frame naming
    /// `name` actually corresponds to a waiter the engine registered.
    /// Gates ack recognition in `engine::dispatch_inbound` so that a
    /// normal command reply whose shape happens to resemble an ack array
    /// (e.g. a bulk reply that is itself `[b"subscribe", ...]`) is never
    /// misrouted away from the ordinary pending queue.
    pub(crate) fn has_subscribe_waiter(&self, kind: SubscriptionKind, name: &[u8]) -> bool {
        self.subscribe_waiters.contains_key(&(kind, Bytes::copy_from_slice(name)))
    }

    pub(crate) fn has_unsubscribe_waiter(&self, kind: SubscriptionKind, name: &[u8]) -> bool {
        self.unsubscribe_waiters.contains_key(&(kind, Bytes::copy_from_slice(name)))
    }

    #[deprecated(note = "use SubscriptionHandle::recv or its Stream impl instead")]
    pub(crate) fn message_bus(&self) -> broadcast::Receiver<Message> {
        self.message_bus.subscribe()
    }

    fn map_mut(&mut self, kind: SubscriptionKind) -> &mut HashMap<Bytes, SubscriptionEntry> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    fn map(&self, kind: SubscriptionKind) -> &HashMap<Bytes, SubscriptionEntry> {
        match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    /// Registers the waiters for one `SUBSCRIBE`/`PSUBSCRIBE` call,
    /// eagerly creating the handle for each channel not already
    /// subscribed to. Returns nothing — results arrive via `reply` once
    /// every channel in `names` has been acknowledged.
    pub(crate) fn begin_subscribe(
        &mut self,
        kind: SubscriptionKind,
        names: Vec<Bytes>,
        reply: oneshot::Sender<Result<Vec<SubscriptionHandle>>>,
    ) {
        let batch = Arc::new(Mutex::new(SubscribeBatch {
            remaining: names.len(),
            handles: (0..names.len()).map(|_| None).collect(),
            reply: Some(reply),
        }));

        for (index, name) in names.into_iter().enumerate() {
            let waiter = if self.map(kind).contains_key(&name) {
                SubscribeWaiter::AlreadySubscribed {
                    batch: batch.clone(),
                    index,
                }
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                self.map_mut(kind).insert(name.clone(), SubscriptionEntry { sender: tx });
                {
                    let mut b = batch.lock().expect("subscribe batch mutex poisoned");
                    b.handles[index] = Some(SubscriptionHandle::new(name.clone(), kind, rx));
                }
                SubscribeWaiter::New {
                    batch: batch.clone(),
                    index,
                }
            };
            self.subscribe_waiters
                .entry((kind, name))
                .or_default()
                .push_back(waiter);
        }
    }

    /// Registers the waiters for one `UNSUBSCRIBE`/`PUNSUBSCRIBE` call.
    /// `names` empty means "all currently subscribed names of this kind",
    /// resolved here since the caller may not know the full set.
    pub(crate) fn begin_unsubscribe(
        &mut self,
        kind: SubscriptionKind,
        names: Vec<Bytes>,
        reply: oneshot::Sender<Result<()>>,
    ) -> Vec<Bytes> {
        let names = if names.is_empty() {
            self.map(kind).keys().cloned().collect()
        } else {
            names
        };

        let batch = Arc::new(Mutex::new(UnsubscribeBatch {
            remaining: names.len().max(1),
            reply: Some(reply),
        }));

        if names.is_empty() {
            // Nothing subscribed of this kind; resolve immediately.
            let mut b = batch.lock().expect("unsubscribe batch mutex poisoned");
            if let Some(reply) = b.reply.take() {
                let _ = reply.send(Ok(()));
            }
            return names;
        } else {
            batch.lock().expect("unsubscribe batch mutex poisoned").remaining = names.len();
        }

        for name in &names {
            self.unsubscribe_waiters
                .entry((kind, name.clone()))
                .or_default()
                .push_back(batch.clone());
        }
        names
    }

    /// Handles a `subscribe`/`psubscribe` ack frame. Returns the new total
    /// subscription count across channels and patterns.
    pub(crate) fn handle_subscribe_ack(&mut self, kind: SubscriptionKind, name: &[u8]) -> usize {
        if let Some(queue) = self.subscribe_waiters.get_mut(&(kind, Bytes::copy_from_slice(name))) {
            if let Some(waiter) = queue.pop_front() {
                match waiter {
                    SubscribeWaiter::New { batch, index } | SubscribeWaiter::AlreadySubscribed { batch, index } => {
                        let mut b = batch.lock().expect("subscribe batch mutex poisoned");
                        let _ = index; // handle already stored at this index
                        b.remaining = b.remaining.saturating_sub(1);
                        if b.remaining == 0 {
                            if let Some(reply) = b.reply.take() {
                                let handles = b.handles.drain(..).flatten().collect();
                                let _ = reply.send(Ok(handles));
                            }
                        }
                    }
                }
            }
            if queue.is_empty() {
                self.subscribe_waiters.remove(&(kind, Bytes::copy_from_slice(name)));
            }
        }
        self.total_subscriptions()
    }

    /// Handles an `unsubscribe`/`punsubscribe` ack frame: closes the
    /// handle's message sink and removes it from the registry. Returns the
    /// new total subscription count.
    pub(crate) fn handle_unsubscribe_ack(&mut self, kind: SubscriptionKind, name: &[u8]) -> usize {
        let key = Bytes::copy_from_slice(name);
        self.map_mut(kind).remove(&key);

        if let Some(queue) = self.unsubscribe_waiters.get_mut(&(kind, key.clone())) {
            if let Some(batch) = queue.pop_front() {
                let mut b = batch.lock().expect("unsubscribe batch mutex poisoned");
                b.remaining = b.remaining.saturating_sub(1);
                if b.remaining == 0 {
                    if let Some(reply) = b.reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            if queue.is_empty() {
                self.unsubscribe_waiters.remove(&(kind, key));
            }
        }
        self.total_subscriptions()
    }

    /// Routes an inbound `message` frame. Logs and drops it if no handle
    /// is registered for the channel (§4.4).
    pub(crate) fn route_message(&self, channel: Bytes, payload: Bytes) {
        let msg = Message {
            kind: MessageKind::Message,
            channel: channel.clone(),
            pattern: None,
            payload,
        };
        match self.channels.get(&channel) {
            Some(entry) => {
                let _ = entry.sender.send(msg.clone());
            }
            None => {
                tracing::error!(?channel, "message for unknown channel; dropping");
            }
        }
        let _ = self.message_bus.send(msg);
    }

    /// Routes an inbound `pmessage` frame.
    pub(crate) fn route_pmessage(&self, pattern: Bytes, channel: Bytes, payload: Bytes) {
        let msg = Message {
            kind: MessageKind::PMessage,
            channel,
            pattern: Some(pattern.clone()),
            payload,
        };
        match self.patterns.get(&pattern) {
            Some(entry) => {
                let _ = entry.sender.send(msg.clone());
            }
            None => {
                tracing::error!(?pattern, "pmessage for unknown pattern; dropping");
            }
        }
        let _ = self.message_bus.send(msg);
    }

    /// Fails every outstanding ack waiter and closes every active handle.
    /// Called on disconnect (§4.3 "Close handling").
    pub(crate) fn close_all(&mut self) {
        self.channels.clear();
        self.patterns.clear();
        for queue in self.subscribe_waiters.values_mut() {
            while let Some(waiter) = queue.pop_front() {
                let (SubscribeWaiter::New { batch, .. } | SubscribeWaiter::AlreadySubscribed { batch, .. }) = waiter;
                let mut b = batch.lock().expect("subscribe batch mutex poisoned");
                if let Some(reply) = b.reply.take() {
                    let _ = reply.send(Err(RedisEngineError::Disconnected));
                }
            }
        }
        self.subscribe_waiters.clear();
        for queue in self.unsubscribe_waiters.values_mut() {
            while let Some(batch) = queue.pop_front() {
                let mut b = batch.lock().expect("unsubscribe batch mutex poisoned");
                if let Some(reply) = b.reply.take() {
                    let _ = reply.send(Err(RedisEngineError::Disconnected));
                }
            }
        }
        self.unsubscribe_waiters.clear();
    }
}
