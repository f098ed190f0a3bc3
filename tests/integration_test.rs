//! Integration tests for Portgate
//!
//! Covers the full client-server flow over loopback:
//! - mutual-TLS control channel with allow-list admission
//! - bind round-trip and shared binds with failover
//! - echo relaying through a bound endpoint, including bursts sent before
//!   the link is confirmed
//! - link lifecycle edge cases driven at the frame level over plain
//!   WebSocket (the session loop is transport-generic)

use bytes::Bytes;
use portgate::channel::{self, ChannelMessage, ChannelReader, FrameSink};
use portgate::client::{self, ClientOptions};
use portgate::config::ProxyRule;
use portgate::link::LinkIdAllocator;
use portgate::protocol::{BindReply, BindRequest, Frame, FrameType};
use portgate::server::allowlist::Allowlist;
use portgate::server::binds::BindRegistry;
use portgate::server::{session, Gateway};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ── Helpers ──────────────────────────────────────────────────────────

/// A certificate identity written to disk, plus its allow-list digest
struct Identity {
    cert_path: PathBuf,
    key_path: PathBuf,
    digest: String,
}

fn identity(name: &str) -> Identity {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();
    let digest = hex::encode(Sha1::digest(key.public_key_der()));

    let tag = format!(
        "portgate-it-{}-{}-{:x}",
        name,
        std::process::id(),
        rand::random::<u64>()
    );
    let cert_path = std::env::temp_dir().join(format!("{}.crt", tag));
    let key_path = std::env::temp_dir().join(format!("{}.key", tag));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key.serialize_pem()).unwrap();

    Identity {
        cert_path,
        key_path,
        digest,
    }
}

/// Start a gateway that admits the given key digests.
///
/// Returns the control endpoint address and the shared gateway state.
async fn start_gateway(allowed: &[&str]) -> (SocketAddr, Arc<Gateway>) {
    let server_id = identity("server");

    let allow_path = std::env::temp_dir().join(format!(
        "portgate-it-allow-{}-{:x}",
        std::process::id(),
        rand::random::<u64>()
    ));
    std::fs::write(&allow_path, allowed.join("\n")).unwrap();
    let allowlist = Allowlist::load(&allow_path).unwrap();

    let tls_config = portgate::tls::server_config(&server_id.cert_path, &server_id.key_path).unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let gateway = Gateway::new(allowlist);
    tokio::spawn(Arc::clone(&gateway).run(listener, acceptor));

    (addr, gateway)
}

fn client_options(id: &Identity, control: SocketAddr, rule: ProxyRule) -> ClientOptions {
    ClientOptions {
        remote_host: "127.0.0.1".to_string(),
        remote_port: control.port(),
        cert_path: id.cert_path.clone(),
        key_path: id.key_path.clone(),
        rule,
    }
}

/// A local TCP service echoing everything back
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// A port that was free a moment ago
async fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

/// One echo round-trip through a bound endpoint
async fn echo_once(port: u16, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut external = TcpStream::connect(("127.0.0.1", port)).await?;
    external.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(2), external.read_exact(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "echo timed out"))??;
    Ok(buf)
}

/// Retry the round-trip until the tunnel is up
async fn echo_eventually(port: u16, payload: &[u8]) -> Vec<u8> {
    for _ in 0..50 {
        if let Ok(reply) = echo_once(port, payload).await {
            return reply;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("endpoint on port {} never echoed", port);
}

async fn assert_eventually_refused(port: u16) {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("port {} still accepts connections", port);
}

// ── End-to-end over mutual TLS ───────────────────────────────────────

#[tokio::test]
async fn test_echo_happy_path() {
    let client_id = identity("client");
    let (control, _gateway) = start_gateway(&[&client_id.digest]).await;
    let echo = start_echo().await;
    let bind_port = free_port().await;

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port,
        local_host: "127.0.0.1".to_string(),
        local_port: echo.port(),
    };
    let _client = tokio::spawn(client::run(client_options(&client_id, control, rule)));

    let reply = echo_eventually(bind_port, b"hello").await;
    assert_eq!(reply, b"hello");

    // a second connection through the same bind also works
    let reply = echo_eventually(bind_port, b"again").await;
    assert_eq!(reply, b"again");
}

#[tokio::test]
async fn test_burst_at_connect_arrives_in_order() {
    let client_id = identity("burst");
    let (control, _gateway) = start_gateway(&[&client_id.digest]).await;
    let echo = start_echo().await;
    let bind_port = free_port().await;

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port,
        local_host: "127.0.0.1".to_string(),
        local_port: echo.port(),
    };
    let _client = tokio::spawn(client::run(client_options(&client_id, control, rule)));

    // make sure the bind is live, then push 512 KiB in one burst right
    // after connecting, before the link can possibly be confirmed
    echo_eventually(bind_port, b"warmup").await;

    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let mut external = TcpStream::connect(("127.0.0.1", bind_port)).await.unwrap();
    external.write_all(&payload).await.unwrap();

    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(20), external.read_exact(&mut reply))
        .await
        .expect("burst echo timed out")
        .unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn test_large_transfer_on_ready_link() {
    let client_id = identity("large");
    let (control, _gateway) = start_gateway(&[&client_id.digest]).await;
    let echo = start_echo().await;
    let bind_port = free_port().await;

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port,
        local_host: "127.0.0.1".to_string(),
        local_port: echo.port(),
    };
    let _client = tokio::spawn(client::run(client_options(&client_id, control, rule)));
    echo_eventually(bind_port, b"warmup").await;

    let mut external = TcpStream::connect(("127.0.0.1", bind_port)).await.unwrap();

    // a small round-trip first: once the probe comes back, the link is
    // confirmed and everything after goes through steady-state forwarding
    external.write_all(b"probe").await.unwrap();
    let mut probe = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(10), external.read_exact(&mut probe))
        .await
        .expect("probe echo timed out")
        .unwrap();
    assert_eq!(&probe, b"probe");

    // now stream 10 MiB through the confirmed link
    let payload: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (mut read_half, mut write_half) = external.into_split();
    let writer = tokio::spawn(async move {
        for chunk in payload.chunks(64 * 1024) {
            write_half.write_all(chunk).await.unwrap();
        }
    });

    let mut reply = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(60), read_half.read_exact(&mut reply))
        .await
        .expect("large echo timed out")
        .unwrap();
    writer.await.unwrap();

    // byte-for-byte: in order, nothing duplicated, nothing lost
    assert_eq!(reply, expected);
}

#[tokio::test]
async fn test_zero_byte_stream() {
    let client_id = identity("zero");
    let (control, _gateway) = start_gateway(&[&client_id.digest]).await;
    let echo = start_echo().await;
    let bind_port = free_port().await;

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port,
        local_host: "127.0.0.1".to_string(),
        local_port: echo.port(),
    };
    let _client = tokio::spawn(client::run(client_options(&client_id, control, rule)));
    echo_eventually(bind_port, b"warmup").await;

    // a connection that sends nothing gets nothing back
    let mut external = TcpStream::connect(("127.0.0.1", bind_port)).await.unwrap();
    external.shutdown().await.unwrap();

    let mut buf = [0u8; 64];
    let outcome = tokio::time::timeout(Duration::from_secs(5), external.read(&mut buf))
        .await
        .expect("close never propagated");
    assert!(matches!(outcome, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_admission_rejects_unknown_key() {
    let admitted = identity("admitted");
    let stranger = identity("stranger");
    let (control, _gateway) = start_gateway(&[&admitted.digest]).await;

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port: free_port().await,
        local_host: "127.0.0.1".to_string(),
        local_port: 1,
    };

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        client::run(client_options(&stranger, control, rule)),
    )
    .await
    .expect("rejected client did not exit");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_bind_refused_when_port_taken() {
    let client_id = identity("refused");
    let (control, _gateway) = start_gateway(&[&client_id.digest]).await;

    // occupy the would-be public endpoint
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_port = blocker.local_addr().unwrap().port();

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port: taken_port,
        local_host: "127.0.0.1".to_string(),
        local_port: 1,
    };

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        client::run(client_options(&client_id, control, rule)),
    )
    .await
    .expect("client did not exit on refused bind");
    match result {
        Err(portgate::Error::BindRefused(_)) => {}
        other => panic!("expected a refused bind, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shared_bind_failover() {
    let id_a = identity("shared-a");
    let id_b = identity("shared-b");
    let (control, gateway) = start_gateway(&[&id_a.digest, &id_b.digest]).await;
    let echo = start_echo().await;
    let bind_port = free_port().await;

    let rule = ProxyRule {
        bind_host: "127.0.0.1".to_string(),
        bind_port,
        local_host: "127.0.0.1".to_string(),
        local_port: echo.port(),
    };

    let client_a = tokio::spawn(client::run(client_options(&id_a, control, rule.clone())));
    assert_eq!(echo_eventually(bind_port, b"via-a").await, b"via-a");

    let client_b = tokio::spawn(client::run(client_options(&id_b, control, rule.clone())));
    // wait until B has joined the existing entry (still one listener)
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(gateway.binds.listener_count().await, 1);

    // A leaves; the endpoint keeps being serviced through B
    client_a.abort();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(echo_eventually(bind_port, b"via-b").await, b"via-b");
    assert_eq!(gateway.binds.listener_count().await, 1);

    // B leaves too; the listener must go away
    client_b.abort();
    assert_eventually_refused(bind_port).await;
    assert_eq!(gateway.binds.listener_count().await, 0);
}

// ── Frame-level session tests over plain WebSocket ───────────────────

/// Run one server session over plain TCP WebSocket and hand out the fake
/// client's end of the channel.
async fn start_session_pair() -> (
    FrameSink<TcpStream>,
    ChannelReader<TcpStream>,
    Arc<BindRegistry>,
    Arc<LinkIdAllocator>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let binds = BindRegistry::new();
    let ids = Arc::new(LinkIdAllocator::new());

    let server_binds = Arc::clone(&binds);
    let server_ids = Arc::clone(&ids);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (sink, reader) = channel::split(ws);
        let _ = session::run(1, sink, reader, server_binds, server_ids).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}", addr), stream)
        .await
        .unwrap();
    let (sink, reader) = channel::split(ws);
    (sink, reader, binds, ids)
}

/// Next frame from the session, answering pings along the way
async fn recv_frame(
    sink: &mut FrameSink<TcpStream>,
    reader: &mut ChannelReader<TcpStream>,
) -> Option<Frame> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match channel::next_message(reader).await {
                ChannelMessage::Frame(frame) => return Some(frame),
                ChannelMessage::Ping(payload) => {
                    let _ = sink.send_pong(payload).await;
                }
                ChannelMessage::Pong(_) => {}
                ChannelMessage::Closed => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Bind an endpoint through the session and assert the mirrored ack
async fn bind_endpoint(
    sink: &mut FrameSink<TcpStream>,
    reader: &mut ChannelReader<TcpStream>,
    bind_link_id: u32,
    port: u16,
) {
    sink.send_frame(Frame::bind(bind_link_id, &BindRequest::new("127.0.0.1", port)))
        .await
        .unwrap();

    let ack = recv_frame(sink, reader).await.expect("channel died");
    assert_eq!(ack.frame_type, FrameType::BindAck);
    assert_eq!(ack.link_id, bind_link_id);
    let reply = BindReply::decode(&ack.payload).unwrap();
    assert!(reply.success, "bind failed: {:?}", reply.error);
}

#[tokio::test]
async fn test_session_early_data_drains_in_order() {
    let (mut sink, mut reader, _binds, _ids) = start_session_pair().await;
    let port = free_port().await;
    bind_endpoint(&mut sink, &mut reader, 3, port).await;

    let mut external = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let open = recv_frame(&mut sink, &mut reader).await.unwrap();
    assert_eq!(open.frame_type, FrameType::Open);
    let link_id = open.link_id;

    // bytes sent before the ack must be buffered, then flushed in order
    external.write_all(b"early-one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    external.write_all(b"early-two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    sink.send_frame(Frame::open(link_id)).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 18 {
        let frame = recv_frame(&mut sink, &mut reader).await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.link_id, link_id);
        received.extend_from_slice(&frame.payload);
    }
    assert_eq!(received, b"early-oneearly-two");

    // the reverse direction reaches the external socket
    sink.send_frame(Frame::data(link_id, Bytes::from_static(b"response")))
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    external.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"response");

    // closing the link closes the external socket
    sink.send_frame(Frame::close(link_id)).await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), external.read(&mut buf))
        .await
        .expect("close never reached the socket");
    assert!(matches!(n, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_session_overflow_closes_link_but_not_channel() {
    let (mut sink, mut reader, _binds, _ids) = start_session_pair().await;
    let port = free_port().await;
    bind_endpoint(&mut sink, &mut reader, 1, port).await;

    let external = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let open = recv_frame(&mut sink, &mut reader).await.unwrap();
    assert_eq!(open.frame_type, FrameType::Open);
    let link_id = open.link_id;

    // never ack; push 2 MiB so the early buffer must overflow
    tokio::spawn(async move {
        let mut external = external;
        let chunk = vec![0u8; 64 * 1024];
        for _ in 0..32 {
            if external.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let frame = recv_frame(&mut sink, &mut reader).await.unwrap();
    assert_eq!(frame.frame_type, FrameType::Close);
    assert_eq!(frame.link_id, link_id);

    // the channel survives: a fresh bind still succeeds
    bind_endpoint(&mut sink, &mut reader, 2, free_port().await).await;
}

#[tokio::test]
async fn test_session_unknown_link_data_is_dropped() {
    let (mut sink, mut reader, _binds, _ids) = start_session_pair().await;

    sink.send_frame(Frame::data(4242, Bytes::from_static(b"junk")))
        .await
        .unwrap();

    // no CLOSE may be emitted for the unknown link: the next frame we see
    // must be the ack for this bind
    bind_endpoint(&mut sink, &mut reader, 7, free_port().await).await;
}

#[tokio::test]
async fn test_session_duplicate_close_is_harmless() {
    let (mut sink, mut reader, binds, ids) = start_session_pair().await;
    let port = free_port().await;
    bind_endpoint(&mut sink, &mut reader, 1, port).await;

    let _external = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let open = recv_frame(&mut sink, &mut reader).await.unwrap();
    let link_id = open.link_id;

    sink.send_frame(Frame::open(link_id)).await.unwrap();
    sink.send_frame(Frame::close(link_id)).await.unwrap();
    sink.send_frame(Frame::close(link_id)).await.unwrap();

    // channel still answers binds, and the link id was released
    bind_endpoint(&mut sink, &mut reader, 2, free_port().await).await;
    assert_eq!(ids.live_count(), 0);
    assert_eq!(binds.listener_count().await, 2);
}

#[tokio::test]
async fn test_session_stalled_link_does_not_block_another() {
    let (mut sink, mut reader, _binds, _ids) = start_session_pair().await;
    let port = free_port().await;
    bind_endpoint(&mut sink, &mut reader, 1, port).await;

    // first link: its external side never reads, so its socket stalls
    let stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let open = recv_frame(&mut sink, &mut reader).await.unwrap();
    assert_eq!(open.frame_type, FrameType::Open);
    let stalled_link = open.link_id;
    sink.send_frame(Frame::open(stalled_link)).await.unwrap();

    // second link: a well-behaved reader
    let mut live = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let open = recv_frame(&mut sink, &mut reader).await.unwrap();
    assert_eq!(open.frame_type, FrameType::Open);
    let live_link = open.link_id;
    assert_ne!(live_link, stalled_link);
    sink.send_frame(Frame::open(live_link)).await.unwrap();

    // push enough at the stalled link to fill its socket buffers many
    // times over, then a frame for the live link behind all of it
    let chunk = Bytes::from(vec![0x5au8; 64 * 1024]);
    for _ in 0..32 {
        sink.send_frame(Frame::data(stalled_link, chunk.clone()))
            .await
            .unwrap();
    }
    sink.send_frame(Frame::data(live_link, Bytes::from_static(b"still-flowing")))
        .await
        .unwrap();

    // the live link's bytes arrive even though the other link is wedged
    let mut buf = [0u8; 13];
    tokio::time::timeout(Duration::from_secs(5), live.read_exact(&mut buf))
        .await
        .expect("live link stalled behind the wedged one")
        .unwrap();
    assert_eq!(&buf, b"still-flowing");

    // the wedged socket is intact, just unread
    drop(stalled);
}

#[tokio::test]
async fn test_session_duplicate_ack_closes_link() {
    let (mut sink, mut reader, _binds, _ids) = start_session_pair().await;
    let port = free_port().await;
    bind_endpoint(&mut sink, &mut reader, 1, port).await;

    let _external = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let open = recv_frame(&mut sink, &mut reader).await.unwrap();
    let link_id = open.link_id;

    sink.send_frame(Frame::open(link_id)).await.unwrap();
    sink.send_frame(Frame::open(link_id)).await.unwrap();

    let frame = recv_frame(&mut sink, &mut reader).await.unwrap();
    assert_eq!(frame.frame_type, FrameType::Close);
    assert_eq!(frame.link_id, link_id);
}
