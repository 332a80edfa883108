//! An asynchronous RESP2 protocol engine: single-connection request/response
//! multiplexing, a pub/sub subscription dispatcher, and a `MULTI`/`EXEC`
//! transaction envelope, built on Tokio.
//!
//! This crate is deliberately narrow. It does not ship a catalog of typed
//! Redis commands, a connection pool, a reconnection policy, or cluster slot
//! routing — those are external collaborators layered on top of
//! [`Engine::execute_command`], the one primitive this crate exposes for
//! sending a command and getting back a [`Reply`].

pub const DEFAULT_PORT: u16 = 6379;

mod wire;
pub use wire::Reply;

mod parser;
pub use parser::Parser;

mod pending;

mod state;
pub use state::ConnectionState;

mod subscription;
pub use subscription::{Message, MessageKind, SubscriptionHandle, SubscriptionKind};

mod transaction;
pub use transaction::{QueuedReply, Transaction};

mod engine;
pub use engine::Engine;

mod error;
pub use error::{ConnectOptions, RedisEngineError, Result};

pub mod io;

/// Cluster slot routing (§9 extension point). Not wired into
/// [`Engine::execute_command`]; see the module docs for why.
pub mod cluster;
