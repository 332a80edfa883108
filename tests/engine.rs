//! End-to-end scenarios from the spec's Testable Properties, driven against
//! an in-memory `tokio::io::duplex` transport plus a hand-written RESP2
//! "fake server" task that decodes commands and writes scripted replies, in
//! the style of `mini-redis`'s raw-byte-assertion `tests/server.rs` but
//! driven through `Engine` instead of raw socket reads/writes.

use bytes::Bytes;
use redis_engine::{ConnectOptions, Engine, Reply, RedisEngineError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Decodes one RESP2 command (array of bulk strings) from `sock`, returning
/// its arguments as owned strings. Minimal by design: the engine only ever
/// sends well-formed arrays of bulk strings, so this need not handle the
/// full reply grammar.
async fn read_command(sock: &mut DuplexStream) -> Vec<String> {
    let count = read_array_header(sock).await;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(read_bulk_string(sock).await);
    }
    args
}

async fn read_line(sock: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        sock.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\r' {
            sock.read_exact(&mut byte).await.unwrap();
            debug_assert_eq!(byte[0], b'\n');
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}

async fn read_array_header(sock: &mut DuplexStream) -> usize {
    let line = read_line(sock).await;
    assert_eq!(&line[..1], "*");
    line[1..].parse().unwrap()
}

async fn read_bulk_string(sock: &mut DuplexStream) -> String {
    let line = read_line(sock).await;
    assert_eq!(&line[..1], "$");
    let len: usize = line[1..].parse().unwrap();
    let mut buf = vec![0u8; len + 2];
    sock.read_exact(&mut buf).await.unwrap();
    String::from_utf8(buf[..len].to_vec()).unwrap()
}

async fn connect_pair() -> (Engine, DuplexStream) {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let engine = Engine::connect(client_side, ConnectOptions::default()).await.unwrap();
    (engine, server_side)
}

fn bytes_args(args: &[&str]) -> Vec<Bytes> {
    args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect()
}

#[tokio::test]
async fn simple_get_set() {
    let (engine, mut server) = connect_pair().await;

    let server_task = tokio::spawn(async move {
        assert_eq!(read_command(&mut server).await, vec!["SET", "foo", "bar"]);
        server.write_all(b"+OK\r\n").await.unwrap();

        assert_eq!(read_command(&mut server).await, vec!["GET", "foo"]);
        server.write_all(b"$3\r\nbar\r\n").await.unwrap();
        server
    });

    let set_reply = engine.execute_command("SET", &bytes_args(&["foo", "bar"])).await.unwrap();
    assert_eq!(set_reply, Reply::SimpleString(Bytes::from_static(b"OK")));

    let get_reply = engine.execute_command("GET", &bytes_args(&["foo"])).await.unwrap();
    assert_eq!(get_reply, Reply::BulkString(Some(Bytes::from_static(b"bar"))));

    server_task.await.unwrap();
}

#[tokio::test]
async fn pipeline_ordering() {
    let (engine, mut server) = connect_pair().await;

    let server_task = tokio::spawn(async move {
        for n in 1..=3i64 {
            assert_eq!(read_command(&mut server).await, vec!["INCR", "k"]);
            server.write_all(format!(":{n}\r\n").as_bytes()).await.unwrap();
        }
        server
    });

    // Submitted back-to-back without awaiting in between.
    let f1 = engine.execute_command("INCR", &bytes_args(&["k"]));
    let f2 = engine.execute_command("INCR", &bytes_args(&["k"]));
    let f3 = engine.execute_command("INCR", &bytes_args(&["k"]));

    assert_eq!(f1.await.unwrap(), Reply::Integer(1));
    assert_eq!(f2.await.unwrap(), Reply::Integer(2));
    assert_eq!(f3.await.unwrap(), Reply::Integer(3));

    server_task.await.unwrap();
}

#[tokio::test]
async fn pubsub_fan_out_and_unsubscribe_returns_to_ready() {
    let (engine, mut server) = connect_pair().await;

    let server_task = tokio::spawn(async move {
        assert_eq!(read_command(&mut server).await, vec!["SUBSCRIBE", "notifications"]);
        server
            .write_all(b"*3\r\n$9\r\nsubscribe\r\n$13\r\nnotifications\r\n:1\r\n")
            .await
            .unwrap();

        server
            .write_all(b"*3\r\n$7\r\nmessage\r\n$13\r\nnotifications\r\n$5\r\nhello\r\n")
            .await
            .unwrap();

        assert_eq!(read_command(&mut server).await, vec!["UNSUBSCRIBE", "notifications"]);
        server
            .write_all(b"*3\r\n$11\r\nunsubscribe\r\n$13\r\nnotifications\r\n:0\r\n")
            .await
            .unwrap();
        server
    });

    let mut handles = engine.subscribe(vec![Bytes::from_static(b"notifications")]).await.unwrap();
    assert_eq!(handles.len(), 1);
    let mut handle = handles.remove(0);

    let msg = handle.recv().await.expect("message delivered");
    assert_eq!(msg.channel, Bytes::from_static(b"notifications"));
    assert_eq!(msg.payload, Bytes::from_static(b"hello"));

    engine.unsubscribe(vec![Bytes::from_static(b"notifications")]).await.unwrap();
    assert!(handle.recv().await.is_none(), "stream completes after unsubscribe ack");

    server_task.await.unwrap();
}

#[tokio::test]
async fn multi_exec_resolves_captured_futures_in_order() {
    let (engine, mut server) = connect_pair().await;

    let server_task = tokio::spawn(async move {
        assert_eq!(read_command(&mut server).await, vec!["MULTI"]);
        server.write_all(b"+OK\r\n").await.unwrap();

        assert_eq!(read_command(&mut server).await, vec!["INCR", "a"]);
        server.write_all(b"+QUEUED\r\n").await.unwrap();

        assert_eq!(read_command(&mut server).await, vec!["INCR", "a"]);
        server.write_all(b"+QUEUED\r\n").await.unwrap();

        assert_eq!(read_command(&mut server).await, vec!["EXEC"]);
        server.write_all(b"*2\r\n:1\r\n:2\r\n").await.unwrap();
        server
    });

    let mut tx = engine.multi().await.unwrap();
    let first = tx.queue("INCR", &bytes_args(&["a"])).await.unwrap();
    let second = tx.queue("INCR", &bytes_args(&["a"])).await.unwrap();
    tx.exec().await.unwrap();

    assert_eq!(first.result().await.unwrap(), Reply::Integer(1));
    assert_eq!(second.result().await.unwrap(), Reply::Integer(2));

    server_task.await.unwrap();
}

#[tokio::test]
async fn misuse_rejected_synchronously_while_subscribed() {
    let (engine, mut server) = connect_pair().await;

    let server_task = tokio::spawn(async move {
        assert_eq!(read_command(&mut server).await, vec!["SUBSCRIBE", "x"]);
        server
            .write_all(b"*3\r\n$9\r\nsubscribe\r\n$1\r\nx\r\n:1\r\n")
            .await
            .unwrap();
        server
    });

    engine.subscribe(vec![Bytes::from_static(b"x")]).await.unwrap();

    let err = engine
        .execute_command("GET", &bytes_args(&["y"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RedisEngineError::ProtocolMisuse { .. }));

    drop(engine);
    server_task.await.unwrap();
}

#[tokio::test]
async fn disconnect_fails_outstanding_and_future_requests() {
    let (engine, server) = connect_pair().await;

    let f1 = engine.execute_command("GET", &bytes_args(&["a"]));
    let f2 = engine.execute_command("GET", &bytes_args(&["b"]));
    let f3 = engine.execute_command("GET", &bytes_args(&["c"]));

    // Close the transport out from under the connection without replying.
    drop(server);

    assert!(matches!(f1.await, Err(RedisEngineError::Disconnected)));
    assert!(matches!(f2.await, Err(RedisEngineError::Disconnected)));
    assert!(matches!(f3.await, Err(RedisEngineError::Disconnected)));

    let err = engine.execute_command("PING", &[]).await.unwrap_err();
    assert!(matches!(err, RedisEngineError::Disconnected));
}

#[tokio::test]
async fn server_error_reply_does_not_disconnect() {
    let (engine, mut server) = connect_pair().await;

    let server_task = tokio::spawn(async move {
        assert_eq!(read_command(&mut server).await, vec!["GET", "foo"]);
        server.write_all(b"-WRONGTYPE wrong kind\r\n").await.unwrap();

        assert_eq!(read_command(&mut server).await, vec!["PING"]);
        server.write_all(b"+PONG\r\n").await.unwrap();
        server
    });

    let err = engine.execute_command("GET", &bytes_args(&["foo"])).await.unwrap_err();
    match err {
        RedisEngineError::Server { kind, .. } => assert_eq!(kind, "WRONGTYPE"),
        other => panic!("expected server error, got {other:?}"),
    }

    // Connection is still usable after a routine server error.
    let pong = engine.execute_command("PING", &[]).await.unwrap();
    assert_eq!(pong, Reply::SimpleString(Bytes::from_static(b"PONG")));

    server_task.await.unwrap();
}
