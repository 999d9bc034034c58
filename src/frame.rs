use crate::error::Error;

/// Maximum size, in bytes, the decoder will ever allocate for a single frame's payload.
/// Guards against a malicious or buggy peer announcing a huge length prefix.
pub const MAX_PAYLOAD_SIZE: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A single logical WebSocket frame, already reassembled across fragmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    pub fn text<S: Into<String>>(data: S) -> Self {
        Self::new(OpCode::Text, data.into().into_bytes())
    }

    pub fn binary(data: Vec<u8>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Builds a close frame; per RFC 6455 §7.4 the body is either empty or a 2-byte code
    /// followed by UTF-8 reason text.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut payload = Vec::with_capacity(2 + reason.len());
                payload.extend_from_slice(&code.to_be_bytes());
                payload.extend_from_slice(reason.as_bytes());
                payload
            }
            None => Vec::new(),
        };
        Self::new(OpCode::Close, payload)
    }

    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn close_reason(&self) -> &[u8] {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return &[];
        }
        &self.payload[2..]
    }
}

/// RFC 6455 §7.4.1 — codes an endpoint is allowed to *send*. 1005/1006/1015 are reserved for
/// internal use and must never appear on the wire; the 3000-4999 ranges are left to libraries
/// and applications.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}
