//! A client-side WebSocket (RFC 6455) engine built around an explicit connection lifecycle
//! state machine.
//!
//! It's an async library based on the tokio runtime, using a `tokio::net::TcpStream` (optionally
//! wrapped in `tokio-rustls`) as the transport, on top of which it implements the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455): the opening
//! handshake, frame encode/decode, fragmentation reassembly, automatic ping/pong, keepalive, and
//! reconnection — all driven from a single `tokio::task` per connection, talked to only through
//! a channel handle.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod transport;
pub mod url;
mod utils;

pub use codec::WsCodec;
pub use config::{ConnectionConfig, SslVerify};
pub use engine::{start, Command, ConnectOutcome, EngineHandle};
pub use error::Error;
pub use frame::{Frame, OpCode};
pub use handler::{
    ConnectDirective, DisconnectDirective, DisconnectReason, FrameDirective, Handler,
    InitDirective, RequestContext,
};
pub use url::{parse_ws_url, WsUrl};
