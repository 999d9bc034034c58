//! Same as `echo_client`, but over `wss://` against a server using a self-signed certificate —
//! demonstrates `SslVerify::Custom` (a CA file) and `SslVerify::None` (local dev only).
//!
//! Run a TLS echo server on 127.0.0.1:9003 first, then:
//!   cargo run --example echo_client_tls

use std::time::Duration;
use ws_engine::{
    start, ConnectDirective, ConnectionConfig, DisconnectDirective, DisconnectReason, Frame,
    FrameDirective, Handler, InitDirective, RequestContext, SslVerify,
};

struct EchoHandler;

struct State;

impl Handler for EchoHandler {
    type State = State;
    type Args = ();
    type ExternalMessage = ();

    fn init(&mut self, _args: ()) -> InitDirective<State> {
        InitDirective::Ok(State)
    }

    fn onconnect(&mut self, ctx: &RequestContext, state: State) -> ConnectDirective<State> {
        println!("connected over TLS to {}:{}{}", ctx.host, ctx.port, ctx.path);
        ConnectDirective::Reply(Frame::text("hello over tls"), state)
    }

    fn ondisconnect(&mut self, reason: DisconnectReason, state: State) -> DisconnectDirective<State> {
        println!("disconnected: {reason}");
        DisconnectDirective::Close(state)
    }

    fn on_frame(&mut self, frame: &Frame, _ctx: &RequestContext, state: State) -> FrameDirective<State> {
        println!("server said: {}", String::from_utf8_lossy(&frame.payload));
        FrameDirective::Close(Vec::new(), state)
    }

    fn on_external_message(&mut self, _msg: (), _ctx: &RequestContext, state: State) -> FrameDirective<State> {
        FrameDirective::Ok(state)
    }

    fn on_terminate(&mut self, reason: DisconnectReason, _ctx: &RequestContext, _state: State) {
        println!("terminated: {reason}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    // SslVerify::None accepts the self-signed cert a local dev server presents. Never use this
    // against a server on the open network.
    let config = ConnectionConfig::new("wss://127.0.0.1:9003/echo").with_ssl_verify(SslVerify::None);
    let handle = start(config, EchoHandler, ())?;
    handle.connect().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.shutdown().await;
    Ok(())
}
