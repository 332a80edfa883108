//! RESP2 wire codec: the `Reply` data type, command encoding, and the leaf
//! byte-scanning primitives the incremental [`crate::parser::Parser`] is
//! built from.
//!
//! Grounded on `mini-redis`'s `frame.rs`, but reworked in two ways the spec
//! requires and `frame.rs` does not provide:
//!
//! - Nil arrays and nil bulk strings are distinct from empty ones
//!   (`Option<_>` instead of a single `Null` variant standing in for both).
//! - `Integer` is `i64`, not `u64`, so values at the ±2⁶³ boundary round-trip
//!   exactly (§8).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RedisEngineError;

/// A fully-decoded RESP2 reply. Arrays nest arbitrarily; a `Reply` is only
/// ever handed to a caller once its entire tree has been parsed (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    /// Absent (`None`) only for the wire's `$-1\r\n` nil bulk string; an
    /// empty bulk string (`$0\r\n\r\n`) is `Some(Bytes::new())`.
    BulkString(Option<Bytes>),
    /// Absent (`None`) only for the wire's `*-1\r\n` nil array; an empty
    /// array (`*0\r\n`) is `Some(Vec::new())`.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Human-readable rendering used by `tracing` call sites and by
    /// `PendingRequest::label`. Not meant to be the primary API for
    /// consuming a reply — callers pattern-match on the variant.
    pub fn describe(&self) -> String {
        match self {
            Reply::SimpleString(s) => String::from_utf8_lossy(s).into_owned(),
            Reply::Error(e) => format!("-{}", String::from_utf8_lossy(e)),
            Reply::Integer(i) => i.to_string(),
            Reply::BulkString(None) => "(nil)".to_string(),
            Reply::BulkString(Some(b)) => format!("{:?}", b),
            Reply::Array(None) => "(nil array)".to_string(),
            Reply::Array(Some(items)) => {
                let mut s = String::from("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&item.describe());
                }
                s.push(']');
                s
            }
        }
    }

    /// Extracts the server error as a `RedisEngineError::Server`, per §4.3's
    /// "resolve the future with a `ServerError` value".
    pub(crate) fn into_engine_error(self) -> Option<RedisEngineError> {
        match self {
            Reply::Error(msg) => {
                let msg = String::from_utf8_lossy(&msg).into_owned();
                Some(RedisEngineError::from_server_message(&msg))
            }
            _ => None,
        }
    }
}

/// Encodes a command as a RESP array of bulk strings: `*<N>\r\n` followed by
/// `N` `$<len>\r\n<bytes>\r\n` entries. Arguments are raw byte sequences —
/// embedded CR, LF and NUL are tolerated, no textual escaping is performed.
pub fn encode_command(name: &str, args: &[Bytes], out: &mut BytesMut) {
    out.put_u8(b'*');
    write_decimal(out, 1 + args.len() as i64);
    write_bulk(out, name.as_bytes());
    for arg in args {
        write_bulk(out, arg);
    }
}

fn write_bulk(out: &mut BytesMut, bytes: &[u8]) {
    out.put_u8(b'$');
    write_decimal(out, bytes.len() as i64);
    out.extend_from_slice(bytes);
    out.extend_from_slice(b"\r\n");
}

fn write_decimal(out: &mut BytesMut, val: i64) {
    out.extend_from_slice(val.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Outcome of attempting to scan one RESP2 "unit" (a complete scalar, or
/// the header of an array) starting at the front of a byte slice.
pub(crate) enum Scanned {
    /// A complete scalar reply, plus the number of bytes it occupied.
    Scalar(Reply, usize),
    /// An array header: declared length and the number of bytes the
    /// header itself (prefix + decimal + CRLF) occupied. `None` length
    /// means a nil array.
    ArrayHeader(Option<usize>, usize),
}

/// Attempts to scan exactly one RESP2 unit from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a complete unit (the
/// caller should wait for more bytes and retry from scratch — nothing is
/// consumed on this path). Returns `Err` on any violation of the RESP2
/// grammar from §4.1: unknown prefix, non-decimal length, a negative
/// length other than `-1`, or a bulk payload whose trailer is not exactly
/// CRLF.
pub(crate) fn scan_one(buf: &[u8]) -> Result<Option<Scanned>, RedisEngineError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let prefix = buf[0];
    match prefix {
        b'+' | b'-' | b':' => {
            let (line, consumed) = match find_line(&buf[1..]) {
                Some((line, len)) => (line, 1 + len),
                None => return Ok(None),
            };
            let reply = match prefix {
                b'+' => Reply::SimpleString(Bytes::copy_from_slice(line)),
                b'-' => Reply::Error(Bytes::copy_from_slice(line)),
                b':' => {
                    let n = parse_decimal_i64(line)?;
                    Reply::Integer(n)
                }
                _ => unreachable!(),
            };
            Ok(Some(Scanned::Scalar(reply, consumed)))
        }
        b'$' => {
            let (line, header_len) = match find_line(&buf[1..]) {
                Some((line, len)) => (line, 1 + len),
                None => return Ok(None),
            };
            let len = parse_length(line)?;
            match len {
                None => Ok(Some(Scanned::Scalar(Reply::BulkString(None), header_len))),
                Some(len) => {
                    let total = header_len + len + 2;
                    if buf.len() < total {
                        return Ok(None);
                    }
                    let body = &buf[header_len..header_len + len];
                    let trailer = &buf[header_len + len..total];
                    if trailer != b"\r\n" {
                        return Err(RedisEngineError::Framing(
                            "bulk string trailer is not CRLF".to_string(),
                        ));
                    }
                    Ok(Some(Scanned::Scalar(
                        Reply::BulkString(Some(Bytes::copy_from_slice(body))),
                        total,
                    )))
                }
            }
        }
        b'*' => {
            let (line, header_len) = match find_line(&buf[1..]) {
                Some((line, len)) => (line, 1 + len),
                None => return Ok(None),
            };
            let len = parse_length(line)?;
            Ok(Some(Scanned::ArrayHeader(len, header_len)))
        }
        other => Err(RedisEngineError::Framing(format!(
            "unknown reply prefix byte {:#04x}",
            other
        ))),
    }
}

/// Finds the first `\r\n` in `rest` (the bytes following a one-byte
/// prefix). Returns the line content and the number of bytes consumed
/// *after* the prefix (line length + 2 for the CRLF).
fn find_line(rest: &[u8]) -> Option<(&[u8], usize)> {
    // A CRLF cannot start at the very last byte.
    if rest.is_empty() {
        return None;
    }
    for i in 0..rest.len().saturating_sub(1) {
        if rest[i] == b'\r' && rest[i + 1] == b'\n' {
            return Some((&rest[..i], i + 2));
        }
    }
    None
}

/// Parses a length field that may be `-1` (nil) or a non-negative decimal.
/// Any other negative value, or a non-decimal field, is a fatal framing
/// error (§4.1).
fn parse_length(line: &[u8]) -> Result<Option<usize>, RedisEngineError> {
    if line == b"-1" {
        return Ok(None);
    }
    if line.first() == Some(&b'-') {
        return Err(RedisEngineError::Framing(format!(
            "invalid negative length {:?}",
            String::from_utf8_lossy(line)
        )));
    }
    let n: i64 = atoi::atoi(line).ok_or_else(|| {
        RedisEngineError::Framing(format!(
            "non-decimal length field {:?}",
            String::from_utf8_lossy(line)
        ))
    })?;
    usize::try_from(n)
        .map(Some)
        .map_err(|_| RedisEngineError::Framing("length field overflow".to_string()))
}

fn parse_decimal_i64(line: &[u8]) -> Result<i64, RedisEngineError> {
    atoi::atoi(line).ok_or_else(|| {
        RedisEngineError::Framing(format!(
            "non-decimal integer field {:?}",
            String::from_utf8_lossy(line)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_as_bulk_array() {
        let mut out = BytesMut::new();
        encode_command("SET", &[Bytes::from_static(b"foo"), Bytes::from_static(b"bar")], &mut out);
        assert_eq!(
            &out[..],
            &b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"[..]
        );
    }

    #[test]
    fn encodes_arguments_with_embedded_crlf_and_nul() {
        let mut out = BytesMut::new();
        let weird = Bytes::from_static(b"a\r\nb\0c");
        encode_command("SET", &[Bytes::from_static(b"k"), weird.clone()], &mut out);
        assert_eq!(
            &out[..],
            &b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$6\r\na\r\nb\0c\r\n"[..]
        );
    }

    #[test]
    fn scans_simple_string() {
        let buf = b"+OK\r\n";
        match scan_one(buf).unwrap().unwrap() {
            Scanned::Scalar(Reply::SimpleString(s), n) => {
                assert_eq!(s, Bytes::from_static(b"OK"));
                assert_eq!(n, buf.len());
            }
            _ => panic!("expected simple string"),
        }
    }

    #[test]
    fn scans_nil_bulk_distinct_from_empty() {
        match scan_one(b"$-1\r\n").unwrap().unwrap() {
            Scanned::Scalar(Reply::BulkString(None), 5) => {}
            other => panic!("expected nil bulk, got {:?}", describe_scan(&other)),
        }
        match scan_one(b"$0\r\n\r\n").unwrap().unwrap() {
            Scanned::Scalar(Reply::BulkString(Some(b)), 7) => assert!(b.is_empty()),
            other => panic!("expected empty bulk, got {:?}", describe_scan(&other)),
        }
    }

    #[test]
    fn rejects_negative_length_other_than_minus_one() {
        assert!(scan_one(b"$-2\r\n").is_err());
        assert!(scan_one(b"*-5\r\n").is_err());
    }

    #[test]
    fn rejects_non_crlf_bulk_trailer() {
        assert!(scan_one(b"$3\r\nfooXX").is_err());
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!(scan_one(b"!nope\r\n").is_err());
    }

    #[test]
    fn integer_at_i64_boundaries_round_trips() {
        for buf in [
            b":9223372036854775807\r\n".to_vec(),
            b":-9223372036854775808\r\n".to_vec(),
        ] {
            match scan_one(&buf).unwrap().unwrap() {
                Scanned::Scalar(Reply::Integer(_), n) => assert_eq!(n, buf.len()),
                other => panic!("expected integer, got {:?}", describe_scan(&other)),
            }
        }
    }

    /// §8 round-trip law: `encode(parse(encode(cmd)))` preserves the
    /// command's argument sequence. An encoded command is wire-identical to
    /// a RESP array-of-bulk-strings reply, so the incremental parser can
    /// decode it directly.
    #[test]
    fn encode_round_trips_through_the_parser() {
        let mut out = BytesMut::new();
        encode_command("SET", &[Bytes::from_static(b"k"), Bytes::from_static(b"v\r\n\0")], &mut out);

        let mut parser = crate::parser::Parser::new();
        let replies = parser.feed(&out);
        assert_eq!(replies.len(), 1);
        match replies.into_iter().next().unwrap().unwrap() {
            Reply::Array(Some(items)) => {
                let decoded: Vec<Bytes> = items
                    .into_iter()
                    .map(|r| match r {
                        Reply::BulkString(Some(b)) => b,
                        other => panic!("expected bulk string, got {:?}", other),
                    })
                    .collect();
                assert_eq!(decoded, vec![
                    Bytes::from_static(b"SET"),
                    Bytes::from_static(b"k"),
                    Bytes::from_static(b"v\r\n\0"),
                ]);
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    fn describe_scan(s: &Scanned) -> &'static str {
        match s {
            Scanned::Scalar(..) => "scalar",
            Scanned::ArrayHeader(..) => "array-header",
        }
    }
}
