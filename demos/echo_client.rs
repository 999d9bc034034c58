//! Connects to a local echo server, sends one message, prints whatever comes back, then closes.
//!
//! Run a plain-text echo server on 127.0.0.1:9002 first, then:
//!   cargo run --example echo_client

use std::time::Duration;
use ws_engine::{
    start, ConnectDirective, ConnectionConfig, DisconnectDirective, DisconnectReason, Frame,
    FrameDirective, Handler, InitDirective, OpCode, RequestContext,
};

struct EchoHandler;

struct State {
    replies_seen: u32,
}

impl Handler for EchoHandler {
    type State = State;
    type Args = ();
    type ExternalMessage = ();

    fn init(&mut self, _args: ()) -> InitDirective<State> {
        InitDirective::Ok(State { replies_seen: 0 })
    }

    fn onconnect(&mut self, ctx: &RequestContext, state: State) -> ConnectDirective<State> {
        println!("connected to {}:{}{}", ctx.host, ctx.port, ctx.path);
        ConnectDirective::Reply(Frame::text("hello"), state)
    }

    fn ondisconnect(&mut self, reason: DisconnectReason, state: State) -> DisconnectDirective<State> {
        println!("disconnected: {reason}");
        DisconnectDirective::Close(state)
    }

    fn on_frame(&mut self, frame: &Frame, _ctx: &RequestContext, mut state: State) -> FrameDirective<State> {
        match frame.opcode {
            OpCode::Text => {
                println!("server said: {}", String::from_utf8_lossy(&frame.payload));
                state.replies_seen += 1;
            }
            OpCode::Ping => println!("server pinged us"),
            _ => {}
        }
        if state.replies_seen >= 1 {
            FrameDirective::Close(Vec::new(), state)
        } else {
            FrameDirective::Ok(state)
        }
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
    let config = ConnectionConfig::new("ws://127.0.0.1:9002/echo");
    let handle = start(config, EchoHandler, ())?;
    handle.connect().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.shutdown().await;
    Ok(())
}
