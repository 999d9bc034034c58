//! End-to-end scenarios driven against a hand-rolled TCP server that speaks just enough of the
//! wire protocol to exercise the real client Engine — no mocking of the Engine itself.
//!
//! The server implementation here is intentionally independent of `ws_engine`'s own handshake
//! and codec code, so these tests cannot pass by accident just because both sides share a bug.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use ws_engine::{
    start, ConnectDirective, ConnectionConfig, DisconnectDirective, DisconnectReason, Frame,
    FrameDirective, Handler, InitDirective, OpCode, RequestContext,
};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_value(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads and validates the client's handshake request, replies with a 101, and returns any
/// bytes the client already pipelined past the terminator (there shouldn't be any in practice).
async fn accept_handshake(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before completing the handshake");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
    };
    let request = String::from_utf8(buf[..header_end].to_vec()).unwrap();
    assert!(request.starts_with("GET"));
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request carries a Sec-WebSocket-Key header")
        .trim()
        .to_string();

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_value(&key)
    );
    stream.write_all(response.as_bytes()).await.unwrap();
}

fn encode_server_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    encode_server_frame_fin(true, opcode, payload)
}

fn encode_server_frame_fin(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode];
    if payload.len() <= 125 {
        out.push(payload.len() as u8);
    } else {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Reads one masked client frame off the wire and returns `(opcode, unmasked payload)`. Only
/// handles payloads small enough for the 7-bit length form, which covers every test below.
async fn read_client_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let opcode = header[0] & 0x0f;
    assert_ne!(header[1] & 0x80, 0, "client frames must be masked");
    let len = (header[1] & 0x7f) as usize;
    assert!(len <= 125, "test server only handles short payloads");
    let mut mask = [0u8; 4];
    stream.read_exact(&mut mask).await.unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    (opcode, payload)
}

#[derive(Debug)]
enum Seen {
    Connected,
    Frame(Frame),
    Disconnected(String),
    Terminated(String),
}

struct ObservingHandler {
    events: mpsc::UnboundedSender<Seen>,
    on_connect_reply: Option<Frame>,
    reconnect_after: Option<Duration>,
}

impl Handler for ObservingHandler {
    type State = ();
    type Args = ();
    type ExternalMessage = ();

    fn init(&mut self, _args: ()) -> InitDirective<()> {
        // Tests drive the first connect explicitly via `EngineHandle::connect`.
        InitDirective::Ok(())
    }

    fn onconnect(&mut self, _ctx: &RequestContext, state: ()) -> ConnectDirective<()> {
        let _ = self.events.send(Seen::Connected);
        match self.on_connect_reply.take() {
            Some(frame) => ConnectDirective::Reply(frame, state),
            None => ConnectDirective::Ok(state),
        }
    }

    fn ondisconnect(&mut self, reason: DisconnectReason, state: ()) -> DisconnectDirective<()> {
        let _ = self.events.send(Seen::Disconnected(reason.to_string()));
        match self.reconnect_after.take() {
            Some(delay) => DisconnectDirective::ReconnectAfter(delay, state),
            None => DisconnectDirective::Close(state),
        }
    }

    fn on_frame(&mut self, frame: &Frame, _ctx: &RequestContext, state: ()) -> FrameDirective<()> {
        let _ = self.events.send(Seen::Frame(frame.clone()));
        FrameDirective::Ok(state)
    }

    fn on_external_message(&mut self, _msg: (), _ctx: &RequestContext, state: ()) -> FrameDirective<()> {
        FrameDirective::Ok(state)
    }

    fn on_terminate(&mut self, reason: DisconnectReason, _ctx: &RequestContext, _state: ()) {
        let _ = self.events.send(Seen::Terminated(reason.to_string()));
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("engine task dropped the event channel")
}

#[tokio::test]
async fn echo_text_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        let (opcode, payload) = read_client_frame(&mut stream).await;
        assert_eq!(opcode, OpCode::Text.as_u8());
        stream
            .write_all(&encode_server_frame(OpCode::Text.as_u8(), &payload))
            .await
            .unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: Some(Frame::text("hello")),
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match next_event(&mut rx).await {
        Seen::Frame(frame) => {
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.payload, b"hello");
        }
        other => panic!("expected an echoed text frame, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn inbound_ping_is_auto_ponged_and_surfaced_to_the_handler() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        stream
            .write_all(&encode_server_frame(OpCode::Ping.as_u8(), &[1, 2, 3]))
            .await
            .unwrap();
        let (opcode, payload) = read_client_frame(&mut stream).await;
        assert_eq!(opcode, OpCode::Pong.as_u8());
        assert_eq!(payload, vec![1, 2, 3]);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match next_event(&mut rx).await {
        Seen::Frame(frame) => {
            assert_eq!(frame.opcode, OpCode::Ping);
            assert_eq!(frame.payload, vec![1, 2, 3]);
        }
        other => panic!("expected the handler to see the ping, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn fragmented_message_is_reassembled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        stream
            .write_all(&encode_server_frame_fin(false, OpCode::Text.as_u8(), b"hel"))
            .await
            .unwrap();
        stream
            .write_all(&encode_server_frame_fin(false, OpCode::Continue.as_u8(), b"lo "))
            .await
            .unwrap();
        stream
            .write_all(&encode_server_frame_fin(true, OpCode::Continue.as_u8(), b"world"))
            .await
            .unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match next_event(&mut rx).await {
        Seen::Frame(frame) => {
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.payload, b"hello world");
        }
        other => panic!("expected one reassembled text frame, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn remote_close_triggers_ondisconnect_with_the_close_reason() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        let mut close_payload = 1000u16.to_be_bytes().to_vec();
        close_payload.extend_from_slice(b"bye");
        stream
            .write_all(&encode_server_frame(OpCode::Close.as_u8(), &close_payload))
            .await
            .unwrap();
        let (opcode, _) = read_client_frame(&mut stream).await;
        assert_eq!(opcode, OpCode::Close.as_u8());
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match next_event(&mut rx).await {
        Seen::Disconnected(reason) => {
            assert!(reason.contains("1000"));
            assert!(reason.contains("bye"));
        }
        other => panic!("expected ondisconnect with RemoteClosed, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn abrupt_transport_close_while_connected_invokes_on_terminate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        // Drop the socket outright instead of sending a close frame — the engine has no
        // graceful signal here, only a reset TCP connection.
        drop(stream);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match next_event(&mut rx).await {
        Seen::Terminated(reason) => assert!(reason.contains("transport error")),
        other => panic!("expected on_terminate for an unexpected transport close, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn transport_reset_while_connected_invokes_on_terminate_not_ondisconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        // SO_LINGER(0) turns the close into a hard RST instead of a clean FIN, so the client's
        // next read surfaces a genuine `io::Error` (ECONNRESET) rather than a `None`/EOF — the
        // path this test exercises is otherwise never hit by `abrupt_transport_close_...`.
        stream.set_zero_linger().unwrap();
        drop(stream);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: Some(Duration::from_millis(50)),
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    // If this regressed to routing transport I/O errors through `protocol_violation`, the
    // handler would see `Disconnected` (with a possible reconnect) instead of `Terminated`.
    match next_event(&mut rx).await {
        Seen::Terminated(reason) => assert!(reason.contains("transport error")),
        other => panic!("expected on_terminate for a reset connection, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn keepalive_timeout_aborts_a_stuck_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // Accept the TCP connection but never answer the HTTP upgrade — this can only be
        // caught by the keepalive ticking during `Handshaking`, not by a frame never arriving
        // on a connection that was never established.
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(stream);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"))
        .with_keepalive(Duration::from_millis(30), 2)
        .with_connect_timeout(Duration::from_secs(10));
    let handle = start(config, handler, ()).unwrap();

    let err = handle.connect().await.expect_err("handshake should never complete");
    assert!(err.to_string().contains("keepalive"), "unexpected error: {err}");
    match next_event(&mut rx).await {
        Seen::Disconnected(reason) => assert!(reason.contains("keepalive")),
        other => panic!("expected ondisconnect with KeepaliveTimeout, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn keepalive_timeout_disconnects_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_handshake(&mut stream).await;
        // Never reply — every auto-ping goes unanswered until the engine gives up. Keep the
        // socket open past the expected timeout so the client's own keepalive accounting is
        // what ends the connection, not an incidental drop on the server side.
        for _ in 0..3 {
            let (opcode, _) = read_client_frame(&mut stream).await;
            assert_eq!(opcode, OpCode::Ping.as_u8());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: None,
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"))
        .with_keepalive(Duration::from_millis(50), 3);
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Seen::Disconnected(reason))) => assert!(reason.contains("keepalive")),
        other => panic!("expected a keepalive timeout disconnect, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn ondisconnect_reconnect_after_reaches_a_second_server_accept() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        accept_handshake(&mut first).await;
        let mut close_payload = 1000u16.to_be_bytes().to_vec();
        close_payload.extend_from_slice(b"restart");
        first
            .write_all(&encode_server_frame(OpCode::Close.as_u8(), &close_payload))
            .await
            .unwrap();
        let _ = read_client_frame(&mut first).await;
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        accept_handshake(&mut second).await;
        second
            .write_all(&encode_server_frame(OpCode::Text.as_u8(), b"back again"))
            .await
            .unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = ObservingHandler {
        events: tx,
        on_connect_reply: None,
        reconnect_after: Some(Duration::from_millis(50)),
    };
    let config = ConnectionConfig::new(format!("ws://{addr}/echo"));
    let handle = start(config, handler, ()).unwrap();
    handle.connect().await.unwrap();

    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    assert!(matches!(next_event(&mut rx).await, Seen::Disconnected(_)));
    assert!(matches!(next_event(&mut rx).await, Seen::Connected));
    match next_event(&mut rx).await {
        Seen::Frame(frame) => assert_eq!(frame.payload, b"back again"),
        other => panic!("expected the post-reconnect frame, got {other:?}"),
    }

    server.await.unwrap();
}
