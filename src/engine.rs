//! The Connection Engine: the state machine (§4.5) and its driver loop. Owns the transport, the
//! partial-read buffer, the keepalive timer, and the handler's user-state; every other module in
//! this crate is a leaf this one calls into.
//!
//! Shaped after the teacher crate's own `start_server_with_config`: a `tokio::spawn`ed task
//! owning all mutable state, talked to only through a channel, with an `EngineHandle` as the
//! caller-facing front door.

use crate::codec::WsCodec;
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::handler::{
    ConnectDirective, DisconnectDirective, DisconnectReason, FrameDirective, Handler,
    InitDirective, RequestContext,
};
use crate::handshake::{build_request, try_validate_response};
use crate::transport::{self, WsStream};
use crate::url::{parse_ws_url, WsUrl};
use crate::utils::generate_websocket_key;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use std::time::Duration;
use tokio_util::codec::Framed;

/// The outcome of a single `connect` attempt, reported back on the reply channel — never a
/// blanket success for an attempt that actually failed (§9 Open Question (a)).
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected,
    Failed(Error),
}

pub enum Command<H: Handler> {
    Connect(oneshot::Sender<ConnectOutcome>),
    Send(Frame, oneshot::Sender<Result<(), Error>>),
    Cast(Frame),
    External(H::ExternalMessage),
    Shutdown,
}

/// Caller-facing front door: a cheaply-cloneable channel handle to a running Engine task.
pub struct EngineHandle<H: Handler> {
    commands: mpsc::Sender<Command<H>>,
}

impl<H: Handler> Clone for EngineHandle<H> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<H: Handler> EngineHandle<H> {
    /// Opens the transport and runs the handshake. Resolves once the outcome is known; never
    /// returns success for an attempt that actually failed (§9 Open Question (a)).
    pub async fn connect(&self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply_tx))
            .await
            .map_err(|_| Error::EngineGone)?;
        match reply_rx.await.map_err(|_| Error::EngineGone)? {
            ConnectOutcome::Connected => Ok(()),
            ConnectOutcome::Failed(err) => Err(err),
        }
    }

    /// Synchronous send (§4.4): resolves once the frame has been handed to the transport, or
    /// with `Error::Disconnected` if the engine isn't `Connected`.
    pub async fn send(&self, frame: Frame) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(frame, reply_tx))
            .await
            .map_err(|_| Error::EngineGone)?;
        reply_rx.await.map_err(|_| Error::EngineGone)?
    }

    /// Fire-and-forget enqueue; dropped silently if the engine is gone or disconnected.
    pub async fn cast(&self, frame: Frame) {
        let _ = self.commands.send(Command::Cast(frame)).await;
    }

    /// Injects an application-level message for `Handler::on_external_message`.
    pub async fn send_external(&self, msg: H::ExternalMessage) {
        let _ = self.commands.send(Command::External(msg)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Handshaking,
    Connected,
}

/// Spawns the engine task and returns a handle to it, mirroring the teacher crate's
/// `start_server_with_config` → spawn → return-handle shape.
pub fn start<H>(config: ConnectionConfig, mut handler: H, args: H::Args) -> Result<EngineHandle<H>, Error>
where
    H: Handler,
{
    let url = parse_ws_url(&config.url)?;
    let (commands_tx, commands_rx) = mpsc::channel(256);

    let (connect_at_startup, initial_state) = match handler.init(args) {
        InitDirective::Ok(state) => (false, state),
        InitDirective::Once(state) => (true, state),
        InitDirective::Reconnect(state) => (true, state),
    };

    let handle = EngineHandle {
        commands: commands_tx.clone(),
    };

    let driver = Driver {
        url,
        config,
        handler,
        state: Some(initial_state),
        fsm: State::Disconnected,
        framed: None,
        ctx: RequestContext {
            host: String::new(),
            port: 0,
            path: String::new(),
        },
        keepalive_interval: None,
        ka_deadline: None,
        ka_attempts: 0,
        reconnect_deadline: None,
        connecting: None,
    };

    tokio::spawn(run(driver, commands_rx, commands_tx, connect_at_startup));

    Ok(handle)
}

struct Driver<H: Handler> {
    url: WsUrl,
    config: ConnectionConfig,
    handler: H,
    /// `None` only while a callback temporarily owns it mid-call.
    state: Option<H::State>,
    fsm: State,
    framed: Option<Framed<WsStream, WsCodec>>,
    ctx: RequestContext,
    keepalive_interval: Option<Duration>,
    ka_deadline: Option<Instant>,
    ka_attempts: u32,
    reconnect_deadline: Option<Instant>,
    /// The in-flight handshake task while `fsm == State::Handshaking`, if any.
    connecting: Option<ConnectAttempt>,
}

/// A handshake running in its own task, so the driver loop can keep servicing keepalive ticks
/// (and everything else) while it's in flight instead of blocking on it (§4.5 `Handshaking`).
struct ConnectAttempt {
    result_rx: oneshot::Receiver<Result<Framed<WsStream, WsCodec>, Error>>,
    reply: Option<oneshot::Sender<ConnectOutcome>>,
    abort: AbortHandle,
}

async fn run<H: Handler>(
    mut driver: Driver<H>,
    mut commands_rx: mpsc::Receiver<Command<H>>,
    commands_tx: mpsc::Sender<Command<H>>,
    connect_at_startup: bool,
) {
    driver.ctx = RequestContext {
        host: driver.url.host.clone(),
        port: driver.url.port,
        path: driver.url.path_with_query.clone(),
    };
    driver.keepalive_interval = driver.config.keepalive_interval();

    if connect_at_startup {
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = commands_tx.send(Command::Connect(reply_tx)).await;
    }

    loop {
        let ka_sleep = async {
            match driver.ka_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let reconnect_sleep = async {
            match driver.reconnect_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let has_framed = driver.framed.is_some();
        let next_frame = async {
            match driver.framed.as_mut() {
                Some(framed) => framed.next().await,
                None => std::future::pending().await,
            }
        };
        let has_connecting = driver.connecting.is_some();
        let connecting_done = async {
            match driver.connecting.as_mut() {
                Some(attempt) => (&mut attempt.result_rx).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            maybe_cmd = commands_rx.recv() => {
                match maybe_cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Connect(reply)) => {
                        driver.reconnect_deadline = None;
                        spawn_connect_attempt(&mut driver, Some(reply));
                    }
                    Some(Command::Send(frame, reply)) => {
                        if driver.fsm != State::Connected {
                            let _ = reply.send(Err(Error::Disconnected));
                        } else {
                            let result = send_frame(&mut driver, frame).await;
                            let failure = result.as_ref().err().map(|err| err.to_string());
                            let _ = reply.send(result);
                            if let Some(reason) = failure {
                                transport_closed(&mut driver, reason).await;
                            }
                        }
                    }
                    Some(Command::Cast(frame)) => {
                        if driver.fsm == State::Connected {
                            if let Err(err) = send_frame(&mut driver, frame).await {
                                transport_closed(&mut driver, err.to_string()).await;
                            }
                        }
                    }
                    Some(Command::External(msg)) => {
                        if driver.fsm == State::Connected {
                            dispatch_external(&mut driver, msg).await;
                        }
                    }
                }
            }

            _ = ka_sleep, if driver.ka_deadline.is_some() => {
                handle_keepalive_tick(&mut driver).await;
            }

            _ = reconnect_sleep, if driver.reconnect_deadline.is_some() => {
                driver.reconnect_deadline = None;
                spawn_connect_attempt(&mut driver, None);
            }

            maybe_frame = next_frame, if has_framed => {
                match maybe_frame {
                    Some(Ok(frame)) => dispatch_frame(&mut driver, frame).await,
                    // `Framed::next()` surfaces a broken read (EOF mid-frame, ECONNRESET, ...) through
                    // the same `Decoder::Error` as a genuine framing violation (tokio_util maps I/O
                    // errors through `Decoder::Error: From<io::Error>`). Only the latter is a protocol
                    // violation (§7); the former is an unrecoverable transport failure and must not go
                    // through the close-frame/`ondisconnect`/reconnect path.
                    Some(Err(err @ (Error::Io { .. } | Error::Timeout { .. }))) => {
                        transport_closed(&mut driver, err.to_string()).await;
                    }
                    Some(Err(err)) => protocol_violation(&mut driver, err).await,
                    None => transport_closed(&mut driver, "connection closed".into()).await,
                }
            }

            result = connecting_done, if has_connecting => {
                let attempt = driver.connecting.take().expect("guarded by has_connecting");
                match result {
                    Ok(Ok(framed)) => {
                        driver.framed = Some(framed);
                        driver.fsm = State::Connected;
                        driver.ka_attempts = 0;
                        if let Some(interval) = driver.keepalive_interval {
                            driver.ka_deadline = Some(Instant::now() + interval);
                        }
                        on_connected(&mut driver).await;
                        if let Some(reply) = attempt.reply {
                            let _ = reply.send(ConnectOutcome::Connected);
                        }
                    }
                    Ok(Err(err)) => fail_connect(&mut driver, err, attempt.reply).await,
                    Err(_recv_err) => {
                        fail_connect(&mut driver, Error::Disconnected, attempt.reply).await;
                    }
                }
            }
        }

        // `state` is only ever `None` here after a terminal callback (`on_terminate`, or a
        // handler panic) consumed it with nothing to hand back — the engine has nothing left
        // to drive and exits rather than looping on a connection it can never use again.
        if driver.state.is_none() {
            break;
        }
    }

    debug!("engine task for {} exiting", driver.url.host);
}

/// `Disconnected | connect command` (§4.5): cancels any pending reconnect timer (done by the
/// caller), opens the transport, sends the handshake, and arms keepalive before the handshake
/// response is even known — the handshake itself runs on its own task so a slow or wedged server
/// can still be caught by a keepalive timeout (`Handshaking | keepalive tick`) instead of only by
/// `connect_timeout`.
fn spawn_connect_attempt<H: Handler>(
    driver: &mut Driver<H>,
    reply: Option<oneshot::Sender<ConnectOutcome>>,
) {
    if let Some(previous) = driver.connecting.take() {
        previous.abort.abort();
        if let Some(reply) = previous.reply {
            let _ = reply.send(ConnectOutcome::Failed(Error::Disconnected));
        }
    }

    driver.fsm = State::Handshaking;
    driver.ka_attempts = 0;
    if let Some(interval) = driver.keepalive_interval {
        driver.ka_deadline = Some(Instant::now() + interval);
    }

    let url = driver.url.clone();
    let ssl_verify = driver.config.ssl_verify.clone();
    let extra_headers = driver.config.extra_headers.clone();
    let timeout = driver.config.connect_timeout();
    let key = generate_websocket_key();

    let (result_tx, result_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        let attempt = async {
            let mut stream = transport::connect(&url, &ssl_verify, timeout).await?;

            let request = build_request(&url, &key, &extra_headers);
            stream.write_all(request.as_bytes()).await?;

            let mut buf = BytesMut::with_capacity(1024);
            let consumed = loop {
                let mut chunk = [0u8; 1024];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::HandshakeRejected("connection closed during handshake".into()));
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(consumed) = try_validate_response(&buf, &key)? {
                    break consumed;
                }
            };

            let remainder = buf.split_off(consumed);
            let mut parts = tokio_util::codec::FramedParts::new(stream, WsCodec::new());
            parts.read_buf = remainder;
            Ok::<_, Error>(Framed::from_parts(parts))
        };

        let outcome = match tokio::time::timeout(timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(elapsed) => Err(Error::from(elapsed)),
        };
        let _ = result_tx.send(outcome);
    });

    driver.connecting = Some(ConnectAttempt {
        result_rx,
        reply,
        abort: join.abort_handle(),
    });
}

async fn fail_connect<H: Handler>(
    driver: &mut Driver<H>,
    err: Error,
    reply: Option<oneshot::Sender<ConnectOutcome>>,
) {
    warn!("connect attempt to {} failed: {err}", driver.url.host);
    let reason = DisconnectReason::TransportError(err.to_string());
    if let Some(reply) = reply {
        let _ = reply.send(ConnectOutcome::Failed(err));
    }
    disconnect(driver, reason).await;
}

async fn on_connected<H: Handler>(driver: &mut Driver<H>) {
    let Some(state) = driver.state.take() else { return };
    let ctx = driver.ctx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| driver.handler.onconnect(&ctx, state)));
    match outcome {
        Ok(ConnectDirective::Ok(state)) => driver.state = Some(state),
        Ok(ConnectDirective::OkWithKeepalive(state, interval)) => {
            driver.state = Some(state);
            driver.keepalive_interval = Some(interval);
            driver.ka_deadline = Some(Instant::now() + interval);
        }
        Ok(ConnectDirective::Reply(frame, state)) => {
            driver.state = Some(state);
            let _ = send_frame(driver, frame).await;
        }
        Ok(ConnectDirective::Close(payload, state)) => {
            driver.state = Some(state);
            let _ = send_frame(driver, Frame::new(OpCode::Close, payload)).await;
            disconnect(driver, DisconnectReason::HandlerFailure("closed by onconnect".into())).await;
        }
        Err(panic) => handler_panicked(driver, panic).await,
    }
}

async fn dispatch_frame<H: Handler>(driver: &mut Driver<H>, frame: Frame) {
    driver.ka_attempts = 0;

    match frame.opcode {
        OpCode::Ping => {
            let _ = send_frame(driver, Frame::pong(frame.payload.clone())).await;
            dispatch_to_handler(driver, frame).await;
        }
        OpCode::Close => {
            let code = frame.close_code().unwrap_or(1000);
            let reason = String::from_utf8_lossy(frame.close_reason()).into_owned();
            let _ = send_frame(driver, Frame::close(Some(code), "")).await;
            disconnect(driver, DisconnectReason::RemoteClosed { code, reason }).await;
        }
        OpCode::Text | OpCode::Binary | OpCode::Pong => {
            dispatch_to_handler(driver, frame).await;
        }
        OpCode::Continue => unreachable!("the Framer reassembles continuations"),
    }
}

async fn dispatch_to_handler<H: Handler>(driver: &mut Driver<H>, frame: Frame) {
    let Some(state) = driver.state.take() else { return };
    let ctx = driver.ctx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        driver.handler.on_frame(&frame, &ctx, state)
    }));
    apply_frame_directive(driver, outcome).await;
}

async fn dispatch_external<H: Handler>(driver: &mut Driver<H>, msg: H::ExternalMessage) {
    let Some(state) = driver.state.take() else { return };
    let ctx = driver.ctx.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        driver.handler.on_external_message(msg, &ctx, state)
    }));
    apply_frame_directive(driver, outcome).await;
}

async fn apply_frame_directive<H: Handler>(
    driver: &mut Driver<H>,
    outcome: std::thread::Result<FrameDirective<H::State>>,
) {
    match outcome {
        Ok(FrameDirective::Ok(state)) => driver.state = Some(state),
        Ok(FrameDirective::Reply(frame, state)) => {
            driver.state = Some(state);
            let _ = send_frame(driver, frame).await;
        }
        Ok(FrameDirective::Close(payload, state)) => {
            driver.state = Some(state);
            let _ = send_frame(driver, Frame::new(OpCode::Close, payload)).await;
            disconnect(driver, DisconnectReason::HandlerFailure("closed by handler".into())).await;
        }
        Err(panic) => handler_panicked(driver, panic).await,
    }
}

async fn handler_panicked<H: Handler>(driver: &mut Driver<H>, panic: Box<dyn std::any::Any + Send>) {
    let message = panic_message(&panic);
    error!("handler panicked: {message}");
    // The panicking call consumed `driver.state` by value; there is no valid state left to hand
    // to `on_terminate`, so the engine can only log and stop (§7 "handler exceptions ... stop the
    // engine", constrained here by Rust's move semantics rather than a GC'd runtime's exceptions).
    driver.state = None;
    close_transport(driver).await;
    driver.fsm = State::Disconnected;
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn protocol_violation<H: Handler>(driver: &mut Driver<H>, err: Error) {
    warn!("protocol violation on {}: {err}", driver.url.host);
    let _ = send_frame(driver, Frame::close(Some(1002), "protocol error")).await;
    disconnect(
        driver,
        DisconnectReason::ProtocolViolation {
            code: 1002,
            reason: err.to_string(),
        },
    )
    .await;
}

async fn transport_closed<H: Handler>(driver: &mut Driver<H>, detail: String) {
    if driver.fsm == State::Connected {
        // §7: an unexpected transport error/EOF while Connected is terminal — `on_terminate`
        // consumes the final state and the engine stops, it does not reconnect.
        if let Some(state) = driver.state.take() {
            let ctx = driver.ctx.clone();
            let reason = DisconnectReason::TransportError(detail);
            let _ = catch_unwind(AssertUnwindSafe(|| {
                driver.handler.on_terminate(reason, &ctx, state)
            }));
        }
        close_transport(driver).await;
        driver.fsm = State::Disconnected;
    } else {
        disconnect(driver, DisconnectReason::TransportError(detail)).await;
    }
}

/// `Handshaking | keepalive tick` and `Connected | keepalive tick` (§4.5). During `Handshaking`
/// there's no `Framed` yet to send an actual ping over — the handshake is still a raw HTTP
/// upgrade exchange, and writing WS frame bytes into it would corrupt that stream — so a tick
/// there only counts toward the missed-attempts budget and, once exceeded, aborts the in-flight
/// handshake task instead of pinging.
async fn handle_keepalive_tick<H: Handler>(driver: &mut Driver<H>) {
    driver.ka_attempts += 1;
    if driver.ka_attempts > driver.config.keepalive_max_attempts {
        if let Some(attempt) = driver.connecting.take() {
            attempt.abort.abort();
            if let Some(reply) = attempt.reply {
                let _ = reply.send(ConnectOutcome::Failed(Error::KeepaliveTimeout));
            }
        }
        disconnect(driver, DisconnectReason::KeepaliveTimeout).await;
        return;
    }
    if driver.fsm == State::Connected {
        let _ = send_frame(driver, Frame::ping(Vec::new())).await;
    }
    if let Some(interval) = driver.keepalive_interval {
        driver.ka_deadline = Some(Instant::now() + interval);
    }
}

async fn send_frame<H: Handler>(driver: &mut Driver<H>, frame: Frame) -> Result<(), Error> {
    match driver.framed.as_mut() {
        Some(framed) => framed.send(frame).await,
        None => Err(Error::Disconnected),
    }
}

async fn close_transport<H: Handler>(driver: &mut Driver<H>) {
    driver.ka_deadline = None;
    driver.ka_attempts = 0;
    if let Some(framed) = driver.framed.take() {
        let mut io = framed.into_inner();
        let _ = io.shutdown().await;
    }
}

async fn disconnect<H: Handler>(driver: &mut Driver<H>, reason: DisconnectReason) {
    close_transport(driver).await;
    driver.fsm = State::Disconnected;

    let Some(state) = driver.state.take() else { return };
    info!("disconnected from {}: {reason}", driver.url.host);
    let outcome = catch_unwind(AssertUnwindSafe(|| driver.handler.ondisconnect(reason, state)));
    match outcome {
        Ok(DisconnectDirective::Ok(state)) => driver.state = Some(state),
        Ok(DisconnectDirective::Reconnect(state)) => {
            driver.state = Some(state);
            driver.reconnect_deadline = Some(Instant::now());
        }
        Ok(DisconnectDirective::ReconnectAfter(delay, state)) => {
            driver.state = Some(state);
            driver.reconnect_deadline = Some(Instant::now() + delay);
        }
        Ok(DisconnectDirective::Close(state)) => {
            let ctx = driver.ctx.clone();
            let _ = catch_unwind(AssertUnwindSafe(|| {
                driver
                    .handler
                    .on_terminate(DisconnectReason::HandlerFailure("closed by handler".into()), &ctx, state)
            }));
            driver.state = None;
        }
        Err(panic) => handler_panicked(driver, panic).await,
    }
}
