use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("{source}")]
    UrlParseError {
        #[from]
        source: ParseError,
    },

    #[error("invalid scheme in WebSocket URL, expected ws:// or wss://")]
    InvalidSchemeUrl,

    #[error("URL has no host")]
    UrlNoHost,

    #[error("failed to establish TLS session: {0}")]
    TlsSetup(String),

    // Framing errors
    #[error("invalid opcode: 0x{0:x}")]
    InvalidOpcode(u8),

    #[error("reserved bit set without a negotiated extension")]
    RsvNotZero,

    #[error("control frames must not be fragmented")]
    ControlFrameFragmented,

    #[error("control frame payload must be at most 125 bytes")]
    ControlFramePayloadSize,

    #[error("continuation frame with no fragmented message in progress")]
    InvalidContinuationFrame,

    #[error("text or binary frame received while a fragmented message is in progress")]
    FragmentedInProgress,

    #[error("frame payload exceeds the configured maximum of {0} bytes")]
    MaxFrameSize(usize),

    #[error("server frame was masked, clients only accept unmasked frames")]
    MaskedServerFrame,

    #[error("close frame carried an invalid status code: {0}")]
    InvalidCloseCode(u16),

    #[error("text frame did not contain valid UTF-8")]
    InvalidUtf8Text,

    // Handshake errors
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    // Engine-level errors
    #[error("keepalive timeout: no frame received within the configured window")]
    KeepaliveTimeout,

    #[error("not connected")]
    Disconnected,

    #[error("engine task is no longer running")]
    EngineGone,
}
