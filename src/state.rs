//! `ConnectionState` (§3) and its transitions (§4.3).

/// The connection's current mode. Determines which commands
/// `execute_command` will accept and how inbound replies are dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    InTransaction,
    /// Subscribed to at least one channel or pattern. The count is the
    /// combined number of channel and pattern subscriptions (§3 invariant:
    /// `n >= 1`, reaching `0` transitions back to `Ready`).
    PubSub(u32),
    Closed,
}

impl ConnectionState {
    pub fn is_pubsub(&self) -> bool {
        matches!(self, ConnectionState::PubSub(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}
