//! End-to-end tests: a real proxy in front of in-process mock shards.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use shoal_protocol::{scan, UnitKind};
use shoal_proxy::metrics::NoopSink;
use shoal_proxy::{Multiplexer, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// A minimal shard: answers the handful of commands the tests exercise
/// and records every command name + first argument it sees.
struct MockShard {
    addr: String,
    log: Arc<Mutex<Vec<String>>>,
    publish_tx: broadcast::Sender<Bytes>,
}

impl MockShard {
    async fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (publish_tx, _) = broadcast::channel(16);
        let shard = Arc::new(Self {
            addr,
            log: Arc::new(Mutex::new(Vec::new())),
            publish_tx,
        });

        let accept_shard = Arc::clone(&shard);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                let shard = Arc::clone(&accept_shard);
                tokio::spawn(async move { shard.serve(sock).await });
            }
        });
        shard
    }

    /// Pushes a raw published-message frame to every subscribed socket.
    fn publish(&self, frame: &'static [u8]) {
        let _ = self.publish_tx.send(Bytes::from_static(frame));
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn serve(&self, mut sock: TcpStream) {
        let mut buf = BytesMut::new();
        loop {
            let complete = loop {
                let frozen = Bytes::copy_from_slice(&buf);
                match scan(&frozen, false) {
                    Ok(Some((unit, consumed))) => {
                        let _ = buf.split_to(consumed);
                        break Some(unit);
                    }
                    Ok(None) => break None,
                    Err(_) => return,
                }
            };

            let Some(unit) = complete else {
                let Ok(n) = sock.read_buf(&mut buf).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                continue;
            };

            let (name, arg) = match unit.kind() {
                UnitKind::Array(Some(elems)) => {
                    let name = elems
                        .first()
                        .and_then(|e| e.string_value())
                        .map(|s| String::from_utf8_lossy(s).to_lowercase())
                        .unwrap_or_default();
                    let arg = elems
                        .get(1)
                        .and_then(|e| e.string_value())
                        .map(|s| String::from_utf8_lossy(s).into_owned());
                    (name, arg)
                }
                _ => (String::new(), None),
            };

            match arg {
                Some(ref arg) => self.log.lock().unwrap().push(format!("{name} {arg}")),
                None => self.log.lock().unwrap().push(name.clone()),
            }

            match name.as_str() {
                "ping" => sock.write_all(b"+PONG\r\n").await.unwrap(),
                "select" | "set" | "quit" => sock.write_all(b"+OK\r\n").await.unwrap(),
                "get" => sock.write_all(b"$3\r\nval\r\n").await.unwrap(),
                "subscribe" => {
                    let channel = arg.unwrap_or_default();
                    let mut ack = BytesMut::new();
                    shoal_protocol::reply::write_subscription_ack(
                        b"subscribe",
                        channel.as_bytes(),
                        1,
                        &mut ack,
                    );
                    sock.write_all(&ack).await.unwrap();

                    // switch to push mode for the rest of this socket
                    let mut rx = self.publish_tx.subscribe();
                    while let Ok(frame) = rx.recv().await {
                        if sock.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
                _ => sock.write_all(b"-ERR unknown command\r\n").await.unwrap(),
            }
        }
    }
}

async fn start_proxy(shards: &[Arc<MockShard>]) -> (Arc<Multiplexer>, String) {
    let endpoints: Vec<String> = shards.iter().map(|s| s.addr.clone()).collect();
    let config = ProxyConfig::from_json(&format!(
        r#"{{
            "listen_addr": "127.0.0.1:0",
            "shards": {},
            "pool_capacity": 2,
            "check_interval_ms": 60000
        }}"#,
        serde_json::to_string(&endpoints).unwrap()
    ))
    .unwrap();

    let mux = Multiplexer::new(&config, Arc::new(NoopSink)).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&mux).run(listener));
    (mux, addr)
}

async fn read_exactly(sock: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), sock.read_exact(&mut out))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    out
}

#[tokio::test]
async fn inline_ping_gets_pong_without_backend_contact() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"+PING\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");

    // the shard never saw it
    assert!(shard.commands().is_empty());
}

#[tokio::test]
async fn select_is_applied_lazily_before_forwarding() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(b"*2\r\n$6\r\nselect\r\n$1\r\n1\r\n")
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");
    // no backend contact yet
    assert!(shard.commands().is_empty());

    client
        .write_all(b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

    let log = shard.commands();
    assert_eq!(log, vec!["select 1".to_string(), "set k".to_string()]);
}

#[tokio::test]
async fn multi_is_rejected_when_multiplexing() {
    let shards = [
        MockShard::start().await,
        MockShard::start().await,
        MockShard::start().await,
    ];
    let (_mux, addr) = start_proxy(&shards).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"*1\r\n$5\r\nmulti\r\n").await.unwrap();
    let expected = b"-ERR This command is not supported\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

    // with arguments the answer is the same
    client
        .write_all(b"*2\r\n$5\r\nmulti\r\n$1\r\nx\r\n")
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
}

#[tokio::test]
async fn published_message_reaches_every_subscribed_session() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let subscribe = b"*2\r\n$9\r\nsubscribe\r\n$3\r\nfoo\r\n";
    let ack = b"*3\r\n$9\r\nsubscribe\r\n$3\r\nfoo\r\n:1\r\n";

    let mut first = TcpStream::connect(&addr).await.unwrap();
    first.write_all(subscribe).await.unwrap();
    assert_eq!(read_exactly(&mut first, ack.len()).await, ack);

    let mut second = TcpStream::connect(&addr).await.unwrap();
    second.write_all(subscribe).await.unwrap();
    assert_eq!(read_exactly(&mut second, ack.len()).await, ack);

    // let the channel worker bind to the shard before publishing
    tokio::time::sleep(Duration::from_millis(200)).await;
    let frame: &[u8] = b"*3\r\n$7\r\nmessage\r\n$3\r\nfoo\r\n$5\r\nhello\r\n";
    shard.publish(frame);

    assert_eq!(read_exactly(&mut first, frame.len()).await, frame);
    assert_eq!(read_exactly(&mut second, frame.len()).await, frame);
}

#[tokio::test]
async fn subscribed_session_rejects_ordinary_commands() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(b"*2\r\n$9\r\nsubscribe\r\n$3\r\nfoo\r\n")
        .await
        .unwrap();
    let ack = b"*3\r\n$9\r\nsubscribe\r\n$3\r\nfoo\r\n:1\r\n";
    assert_eq!(read_exactly(&mut client, ack.len()).await, ack);

    client
        .write_all(b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n")
        .await
        .unwrap();
    let expected = b"-ERR This command is not supported\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

    // the rejected get never reaches a shard
    assert!(!shard.commands().iter().any(|c| c.starts_with("get")));
}

#[tokio::test]
async fn pipelined_commands_reply_in_order() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    // one write carrying three commands: set, get, bare ping
    client
        .write_all(b"*3\r\n$3\r\nset\r\n$1\r\na\r\n$1\r\n1\r\n*2\r\n$3\r\nget\r\n$1\r\na\r\n*1\r\n$4\r\nping\r\n")
        .await
        .unwrap();

    let expected = b"+OK\r\n$3\r\nval\r\n+PONG\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
}

#[tokio::test]
async fn truncated_command_completes_on_a_later_read() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    // everything but the final terminator; the proxy must wait, not error
    client
        .write_all(b"*2\r\n$3\r\nget\r\n$1\r\na")
        .await
        .unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(b"\r\n").await.unwrap();

    assert_eq!(read_exactly(&mut client, 9).await, b"$3\r\nval\r\n");
}

#[tokio::test]
async fn syntax_error_is_recoverable_for_the_session() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    // a valid set, then a bulk whose payload terminator is corrupt
    client
        .write_all(b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n$3\r\nfoXYZ")
        .await
        .unwrap();

    // the set is answered before the error is reported
    let expected = b"+OK\r\n-ERR Protocol error\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

    // the session keeps working on the client's next write
    client.write_all(b"*1\r\n$4\r\nping\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");
}

#[tokio::test]
async fn quit_acknowledges_and_closes() {
    let shard = MockShard::start().await;
    let (_mux, addr) = start_proxy(&[Arc::clone(&shard)]).await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(b"*1\r\n$4\r\nquit\r\n").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

    // the proxy closes its side after the acknowledgement
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("socket did not close")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn all_shards_down_yields_connection_down() {
    // a shard that exists only long enough for the pools to fill
    let doomed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let doomed_addr = doomed.local_addr().unwrap().to_string();
    drop(doomed);

    let config = ProxyConfig::from_json(&format!(
        r#"{{
            "listen_addr": "127.0.0.1:0",
            "shards": ["{doomed_addr}"],
            "pool_capacity": 1,
            "connect_timeout_ms": 100,
            "backend_read_timeout_ms": 100,
            "backend_write_timeout_ms": 100
        }}"#
    ))
    .unwrap();
    let mux = Multiplexer::new(&config, Arc::new(NoopSink)).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&mux).run(listener));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n")
        .await
        .unwrap();
    let expected = b"-ERR Connection down\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
}
