//! The incremental parser state machine (§4.2).
//!
//! `mini-redis::frame::Frame::check`/`parse` re-walk a `Cursor` over the
//! whole read buffer on every poll, which only works because that
//! connection reads and parses one frame per `read_frame` call before going
//! back to the socket. The engine here is pipelined — many commands may be
//! in flight, and a single `feed` of socket bytes can contain any number of
//! complete replies plus a trailing partial one — so the parser instead
//! keeps an explicit stack of in-progress array frames that persists
//! across calls, and never re-scans bytes it has already consumed.

use bytes::{Buf, BytesMut};

use crate::error::RedisEngineError;
use crate::wire::{scan_one, Reply, Scanned};

struct ArrayFrame {
    remaining: usize,
    items: Vec<Reply>,
}

/// Owns the accumulating read buffer and the stack of partially-built
/// array contexts. One `Parser` per connection; feeding it is the only way
/// to make progress.
#[derive(Default)]
pub struct Parser {
    buf: BytesMut,
    stack: Vec<ArrayFrame>,
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            buf: BytesMut::with_capacity(4 * 1024),
            stack: Vec::new(),
        }
    }

    /// Feeds a chunk of bytes received from the transport and returns every
    /// top-level reply that becomes fully decodable as a result. Any
    /// trailing partial data (including partially-built nested arrays) is
    /// retained in the parser for the next call.
    ///
    /// Once a `Framing` error is produced the parser has no further
    /// defined behavior — per §7 it is fatal to the connection and the
    /// caller is expected to tear the connection down rather than keep
    /// feeding it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Reply, RedisEngineError>> {
        if self.buf.capacity() - self.buf.len() < bytes.len() {
            self.buf.reserve(bytes.len().max(self.buf.capacity()));
        }
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        loop {
            match scan_one(&self.buf) {
                Ok(None) => break,
                Ok(Some(Scanned::Scalar(reply, consumed))) => {
                    self.buf.advance(consumed);
                    self.deliver(reply, &mut out);
                }
                Ok(Some(Scanned::ArrayHeader(None, consumed))) => {
                    self.buf.advance(consumed);
                    self.deliver(Reply::Array(None), &mut out);
                }
                Ok(Some(Scanned::ArrayHeader(Some(0), consumed))) => {
                    self.buf.advance(consumed);
                    self.deliver(Reply::Array(Some(Vec::new())), &mut out);
                }
                Ok(Some(Scanned::ArrayHeader(Some(len), consumed))) => {
                    self.buf.advance(consumed);
                    self.stack.push(ArrayFrame {
                        remaining: len,
                        items: Vec::with_capacity(len),
                    });
                }
                Err(e) => {
                    out.push(Err(e));
                    break;
                }
            }
        }
        out
    }

    /// Bubbles a just-completed value up through any open array frames,
    /// emitting it to `out` only once it reaches the top level.
    fn deliver(&mut self, mut value: Reply, out: &mut Vec<Result<Reply, RedisEngineError>>) {
        loop {
            match self.stack.last_mut() {
                None => {
                    out.push(Ok(value));
                    return;
                }
                Some(frame) => {
                    frame.items.push(value);
                    frame.remaining -= 1;
                    if frame.remaining != 0 {
                        return;
                    }
                    let frame = self.stack.pop().expect("just matched Some");
                    value = Reply::Array(Some(frame.items));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn replies(p: &mut Parser, bytes: &[u8]) -> Vec<Reply> {
        p.feed(bytes)
            .into_iter()
            .map(|r| r.expect("unexpected framing error"))
            .collect()
    }

    #[test]
    fn parses_whole_message_in_one_feed() {
        let mut p = Parser::new();
        let out = replies(&mut p, b"+OK\r\n");
        assert_eq!(out, vec![Reply::SimpleString(Bytes::from_static(b"OK"))]);
    }

    #[test]
    fn fragmentation_at_any_byte_boundary_yields_same_sequence() {
        let msg = b"*2\r\n$3\r\nfoo\r\n:42\r\n+OK\r\n$-1\r\n*-1\r\n*0\r\n";

        let mut whole = Parser::new();
        let whole_out = replies(&mut whole, msg);

        for split_count in [1usize, 2, 3, msg.len()] {
            let mut p = Parser::new();
            let mut out = Vec::new();
            let chunk_len = (msg.len() / split_count).max(1);
            for chunk in msg.chunks(chunk_len) {
                out.extend(replies(&mut p, chunk));
            }
            assert_eq!(out, whole_out, "split into chunks of {chunk_len}");
        }

        // byte-at-a-time, the most adversarial chunking
        let mut p = Parser::new();
        let mut out = Vec::new();
        for b in msg {
            out.extend(replies(&mut p, &[*b]));
        }
        assert_eq!(out, whole_out);
    }

    #[test]
    fn nested_arrays_parse_and_retain_partial_state_across_feeds() {
        let mut p = Parser::new();
        // *1\r\n *2\r\n :1\r\n :2\r\n  -- an array containing one array of two integers
        assert!(replies(&mut p, b"*1\r\n*2\r\n:1\r\n").is_empty());
        let out = replies(&mut p, b":2\r\n");
        assert_eq!(
            out,
            vec![Reply::Array(Some(vec![Reply::Array(Some(vec![
                Reply::Integer(1),
                Reply::Integer(2)
            ]))]))]
        );
    }

    #[test]
    fn empty_array_and_nil_array_are_distinct() {
        let mut p = Parser::new();
        let out = replies(&mut p, b"*0\r\n*-1\r\n");
        assert_eq!(out, vec![Reply::Array(Some(vec![])), Reply::Array(None)]);
    }

    #[test]
    fn bulk_string_with_embedded_crlf_parses_correctly() {
        let mut p = Parser::new();
        let out = replies(&mut p, b"$6\r\nfo\r\nbr\r\n");
        assert_eq!(
            out,
            vec![Reply::BulkString(Some(Bytes::from_static(b"fo\r\nbr")))]
        );
    }

    #[test]
    fn unknown_prefix_is_fatal_framing_error() {
        let mut p = Parser::new();
        let out = p.feed(b"!bogus\r\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(RedisEngineError::Framing(_))));
    }

    /// Fuzzes the chunk boundaries a handful of pipelined replies get split
    /// across and checks the emitted sequence never depends on where the
    /// cuts land (§8, "for all byte-stream splittings ... any chunking").
    #[test]
    fn random_chunk_boundaries_never_change_emitted_sequence() {
        use rand::Rng;

        let msg: &[u8] = b"*2\r\n$3\r\nfoo\r\n:42\r\n\
            *3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n\
            -ERR boom\r\n$0\r\n\r\n*0\r\n$-1\r\n*-1\r\n";

        let mut whole = Parser::new();
        let expected = replies(&mut whole, msg);

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut p = Parser::new();
            let mut out = Vec::new();
            let mut pos = 0;
            while pos < msg.len() {
                let remaining = msg.len() - pos;
                let take = rng.gen_range(1..=remaining);
                out.extend(replies(&mut p, &msg[pos..pos + take]));
                pos += take;
            }
            assert_eq!(out, expected);
        }
    }
}
