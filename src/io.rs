//! Type-erased transport bound.
//!
//! Grounded on `mini-redis`'s `io.rs`, trimmed to the piece that survives
//! without `turmoil`/simulation testing: a marker trait so the engine can
//! be generic over "anything that reads and writes bytes" instead of
//! hard-coding `TcpStream`, which is what §6 calls the "transport contract
//! consumed" (`write`, `on_read`, `close` — satisfied here by `AsyncWrite`/
//! `AsyncRead`/drop rather than a bespoke trait, since Tokio's own traits
//! already model exactly that contract).

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the engine can drive a connection over: a real `TcpStream`, a
/// TLS-wrapped stream from an external collaborator, or an in-memory
/// `tokio::io::DuplexStream` in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}
