//! A client that keeps reconnecting after the server drops the connection, and sends a ticked
//! message on every interval while connected — mirrors the teacher crate's own example client's
//! `tokio::select!` ticker pattern, rebuilt around the Engine's directive-based handler.
//!
//! Run a server on 127.0.0.1:9002 first, then:
//!   cargo run --example reconnecting_ticker

use std::time::Duration;
use ws_engine::{
    start, ConnectDirective, ConnectionConfig, DisconnectDirective, DisconnectReason, Frame,
    FrameDirective, Handler, InitDirective, RequestContext,
};

struct TickerHandler;

struct State {
    messages_sent: u32,
}

impl Handler for TickerHandler {
    type State = State;
    type Args = ();
    type ExternalMessage = ();

    fn init(&mut self, _args: ()) -> InitDirective<State> {
        InitDirective::Reconnect(State { messages_sent: 0 })
    }

    fn onconnect(&mut self, ctx: &RequestContext, state: State) -> ConnectDirective<State> {
        println!("connected to {}:{}{}", ctx.host, ctx.port, ctx.path);
        ConnectDirective::OkWithKeepalive(state, Duration::from_secs(10))
    }

    fn ondisconnect(&mut self, reason: DisconnectReason, state: State) -> DisconnectDirective<State> {
        println!("disconnected ({reason}); reconnecting in 500ms");
        DisconnectDirective::ReconnectAfter(Duration::from_millis(500), state)
    }

    fn on_frame(&mut self, frame: &Frame, _ctx: &RequestContext, state: State) -> FrameDirective<State> {
        println!("received: {}", String::from_utf8_lossy(&frame.payload));
        FrameDirective::Ok(state)
    }

    fn on_external_message(
        &mut self,
        _msg: (),
        _ctx: &RequestContext,
        mut state: State,
    ) -> FrameDirective<State> {
        state.messages_sent += 1;
        FrameDirective::Reply(Frame::text(format!("tick {}", state.messages_sent)), state)
    }

    fn on_terminate(&mut self, reason: DisconnectReason, _ctx: &RequestContext, _state: State) {
        println!("terminated: {reason}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = ConnectionConfig::new("ws://127.0.0.1:9002/ticker");
    let handle = start(config, TickerHandler, ())?;

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    for _ in 0..3 {
        ticker.tick().await;
        handle.send_external(()).await;
    }
    handle.shutdown().await;
    Ok(())
}
