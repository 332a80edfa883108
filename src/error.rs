//! Error taxonomy and connection options for the engine.
//!
//! `mini-redis` itself gets away with a single boxed `dyn Error`, but the
//! engine's callers need to distinguish a dropped connection from a
//! misused API from a routine `-ERR` reply, so the kinds from the spec are
//! modeled as an explicit enum instead.

use std::fmt;

/// The crate-wide error type. Every kind from the spec's error taxonomy
/// (§7) has a matching variant; callers pattern-match on it rather than
/// string-sniffing a boxed error.
#[derive(Debug, thiserror::Error)]
pub enum RedisEngineError {
    /// The parser observed a byte sequence that violates RESP2. Fatal to
    /// the connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// A `-` reply from the server. Routine; the connection continues.
    #[error("{kind}: {message}")]
    Server { kind: String, message: String },

    /// The caller attempted an operation disallowed by the current mode
    /// (a regular command while subscribed, a nested `MULTI`, ...).
    #[error("protocol misuse: {reason}")]
    ProtocolMisuse { reason: String },

    /// The connection is closed, cleanly or not. Every pending request and
    /// subscription stream observes this once the background task exits.
    #[error("connection disconnected")]
    Disconnected,

    /// A transaction was discarded, either explicitly or because the
    /// caller's closure errored or the `Transaction` handle was dropped.
    #[error("transaction aborted")]
    TransactionAborted,

    /// The caller cancelled the future before a reply arrived.
    #[error("request cancelled")]
    Cancelled,

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RedisEngineError {
    pub(crate) fn server(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RedisEngineError::Server {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub(crate) fn protocol_misuse(reason: impl Into<String>) -> Self {
        RedisEngineError::ProtocolMisuse {
            reason: reason.into(),
        }
    }

    /// Splits a `-ERR` message into its leading token and remainder, per
    /// §4.3's "Error replies ... resolve the future with a `ServerError`
    /// value carrying the error kind token".
    pub(crate) fn from_server_message(message: &str) -> Self {
        match message.split_once(' ') {
            Some((kind, rest)) => RedisEngineError::server(kind, rest),
            None => RedisEngineError::server(message, ""),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RedisEngineError>;

/// Connection configuration: host/port/auth/pipeline watermark (§6).
///
/// The engine itself does not parse a configuration file format — that is
/// an external collaborator's job — but it does own this small value
/// object and an `from_env` convenience, mirroring the `host`/`port`
/// defaults `mini-redis`'s CLI binaries already hard-code as flag defaults.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub auth: Option<bytes::Bytes>,
    /// Advisory watermark for `Engine::pipeline_depth`. Not enforced as
    /// backpressure (§9 Open Questions).
    pub pipeline_depth_watermark: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            host: "localhost".to_string(),
            port: crate::DEFAULT_PORT,
            auth: None,
            pipeline_depth_watermark: None,
        }
    }
}

impl ConnectOptions {
    /// Reads `REDIS_HOST`/`REDIS_PORT`/`REDIS_AUTH` from the environment,
    /// falling back to `Default::default()` for anything absent or
    /// unparsable.
    pub fn from_env() -> Self {
        let defaults = ConnectOptions::default();
        let host = std::env::var("REDIS_HOST").unwrap_or(defaults.host);
        let port = std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let auth = std::env::var("REDIS_AUTH")
            .ok()
            .map(bytes::Bytes::from);

        ConnectOptions {
            host,
            port,
            auth,
            pipeline_depth_watermark: defaults.pipeline_depth_watermark,
        }
    }
}

impl fmt::Display for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
