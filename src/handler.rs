//! The contract user code implements (§4.3). Five operations, each taking the handler's own
//! state by value and returning a directive plus the new state — the Engine holds exactly one
//! copy of that state and swaps it in on every callback return, so it is never aliased.

use crate::frame::Frame;
use std::time::Duration;

/// Per-connection properties the handler is given alongside a frame, so it can reply without
/// reaching back into the Engine (§3 RequestContext, restricted to the subset a callback needs).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Why the engine is no longer connected, handed to `ondisconnect`/`on_terminate`.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    TransportError(String),
    HandshakeRejected(String),
    RemoteClosed { code: u16, reason: String },
    ProtocolViolation { code: u16, reason: String },
    KeepaliveTimeout,
    HandlerFailure(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::TransportError(reason) => write!(f, "transport error: {reason}"),
            DisconnectReason::HandshakeRejected(reason) => {
                write!(f, "handshake rejected: {reason}")
            }
            DisconnectReason::RemoteClosed { code, reason } => {
                write!(f, "remote closed (code {code}): {reason}")
            }
            DisconnectReason::ProtocolViolation { code, reason } => {
                write!(f, "protocol violation (code {code}): {reason}")
            }
            DisconnectReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
            DisconnectReason::HandlerFailure(reason) => write!(f, "handler failure: {reason}"),
        }
    }
}

/// Returned by `Handler::init`.
pub enum InitDirective<S> {
    /// Start disconnected; wait for an explicit `connect` command.
    Ok(S),
    /// Attempt one connect immediately; do not reconnect on failure.
    Once(S),
    /// Attempt connect and keep reconnecting on failure.
    Reconnect(S),
}

/// Returned by `Handler::onconnect`.
pub enum ConnectDirective<S> {
    Ok(S),
    OkWithKeepalive(S, Duration),
    Reply(Frame, S),
    Close(Vec<u8>, S),
}

/// Returned by `Handler::ondisconnect`.
pub enum DisconnectDirective<S> {
    /// Stay disconnected.
    Ok(S),
    /// Reconnect immediately.
    Reconnect(S),
    /// Reconnect after the given delay.
    ReconnectAfter(Duration, S),
    /// Terminate the engine.
    Close(S),
}

/// Returned by `Handler::on_frame` and `Handler::on_external_message`.
pub enum FrameDirective<S> {
    Ok(S),
    Reply(Frame, S),
    Close(Vec<u8>, S),
}

/// User-supplied callback set (§4.3). `State` is moved through every callback, never shared or
/// cloned by the Engine.
pub trait Handler: Send + 'static {
    type State: Send + 'static;
    /// Opaque argument passed straight through from `start` to `init`.
    type Args: Send + 'static;
    /// Application-level message injected from outside the transport (§4.5 "external message").
    type ExternalMessage: Send + 'static;

    fn init(&mut self, args: Self::Args) -> InitDirective<Self::State>;

    fn onconnect(&mut self, ctx: &RequestContext, state: Self::State) -> ConnectDirective<Self::State>;

    fn ondisconnect(
        &mut self,
        reason: DisconnectReason,
        state: Self::State,
    ) -> DisconnectDirective<Self::State>;

    fn on_frame(
        &mut self,
        frame: &Frame,
        ctx: &RequestContext,
        state: Self::State,
    ) -> FrameDirective<Self::State>;

    fn on_external_message(
        &mut self,
        msg: Self::ExternalMessage,
        ctx: &RequestContext,
        state: Self::State,
    ) -> FrameDirective<Self::State>;

    fn on_terminate(&mut self, reason: DisconnectReason, ctx: &RequestContext, state: Self::State);
}
