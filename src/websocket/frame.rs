//! WebSocket frame codec.
//!
//! Pure functions converting payloads into wire frames and wire bytes back
//! into frames. No I/O happens here; the event loop owns all buffering and
//! calls [`decode`] again once more bytes have arrived.
//!
//! ## Wire Format
//!
//! ```text
//! byte 0:  FIN(1) RSV(3) OPCODE(4)
//! byte 1:  MASK(1) LEN(7)
//! LEN 126: 2-byte big-endian payload length follows
//! LEN 127: 8-byte big-endian payload length follows (MSB must be 0)
//! MASK 1:  4-byte masking key follows the length
//! ```
//!
//! Fragmentation is not supported: outgoing frames always carry FIN, and
//! the FIN/RSV bits of incoming frames are ignored.

use bytes::{BufMut, BytesMut};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LEN_MASK: u8 = 0x7F;

const LEN_16_MARKER: u8 = 126;
const LEN_64_MARKER: u8 = 127;

/// Largest payload expressible in the 7-bit length field.
const MAX_INLINE_LEN: u64 = 125;

/// Largest payload representable on the wire (MSB of the 64-bit length is reserved).
pub const MAX_PAYLOAD_LEN: u64 = u64::MAX >> 1;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// UTF-8 text.
    Text = 0x1,
    /// Opaque bytes.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Reachability probe.
    Ping = 0x9,
    /// Response to a ping.
    Pong = 0xA,
}

impl OpCode {
    /// Parse the low nibble of the first frame byte.
    pub fn from_u8(value: u8) -> Option<OpCode> {
        match value {
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Control frames (close, ping, pong) as opposed to data frames.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
    /// Whether the frame arrived with a masking key.
    pub masked: bool,
}

impl Frame {
    /// Declared payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Result of a decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame and the number of buffer bytes it occupied.
    Complete(Frame, usize),
    /// More bytes are needed before a frame can be produced.
    Incomplete,
}

/// Frame encoding/decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Client frame without a masking key.
    ProtocolViolation,
    /// Opcode outside {text, binary, close, ping, pong}.
    UnsupportedOpcode(u8),
    /// Payload length not representable, or above the configured limit.
    FrameTooLarge(u64),
}

impl FrameError {
    /// Close code associated with the error, reported in close reasons.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::ProtocolViolation => 1002,
            FrameError::UnsupportedOpcode(_) => 1003,
            FrameError::FrameTooLarge(_) => 1004,
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::ProtocolViolation => {
                write!(f, "protocol error ({}): client frame is not masked", self.close_code())
            }
            FrameError::UnsupportedOpcode(op) => {
                write!(f, "unknown opcode ({}): 0x{:X}", self.close_code(), op)
            }
            FrameError::FrameTooLarge(len) => {
                write!(f, "frame too large ({}): {} bytes", self.close_code(), len)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode an unmasked frame (the server send path).
pub fn encode(payload: &[u8], opcode: OpCode) -> Result<BytesMut, FrameError> {
    encode_frame(payload, opcode, None)
}

/// Encode a frame masked with a fresh random key.
pub fn encode_masked(payload: &[u8], opcode: OpCode) -> Result<BytesMut, FrameError> {
    let key: [u8; 4] = rand::random();
    encode_frame(payload, opcode, Some(key))
}

/// Encode a frame masked with the given key.
pub fn encode_with_mask(
    payload: &[u8],
    opcode: OpCode,
    key: [u8; 4],
) -> Result<BytesMut, FrameError> {
    encode_frame(payload, opcode, Some(key))
}

fn encode_frame(
    payload: &[u8],
    opcode: OpCode,
    mask: Option<[u8; 4]>,
) -> Result<BytesMut, FrameError> {
    let len = payload.len() as u64;
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };

    let mut out = BytesMut::with_capacity(header_len(len, mask.is_some()) + payload.len());
    out.put_u8(FIN_BIT | opcode as u8);
    put_length(&mut out, len, mask_bit)?;

    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.put_slice(payload),
    }

    Ok(out)
}

/// Write the length byte and any extended length, using the smallest encoding.
fn put_length(out: &mut BytesMut, len: u64, mask_bit: u8) -> Result<(), FrameError> {
    if len <= MAX_INLINE_LEN {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as u64 {
        out.put_u8(mask_bit | LEN_16_MARKER);
        out.put_u16(len as u16);
    } else {
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::FrameTooLarge(len));
        }
        out.put_u8(mask_bit | LEN_64_MARKER);
        out.put_u64(len);
    }
    Ok(())
}

fn header_len(len: u64, masked: bool) -> usize {
    let extended = match len {
        0..=MAX_INLINE_LEN => 0,
        126..=0xFFFF => 2,
        _ => 8,
    };
    2 + extended + if masked { 4 } else { 0 }
}

/// XOR `buf` with the masking key. Applying it twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decode one client frame from the start of `buf`.
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    decode_limited(buf, MAX_PAYLOAD_LEN)
}

/// Decode one client frame, rejecting declared payloads above `max_payload`.
///
/// The opcode and mask flag are validated as soon as their bytes are
/// available, so a bad frame is reported without waiting for its payload.
pub fn decode_limited(buf: &[u8], max_payload: u64) -> Result<Decoded, FrameError> {
    let Some(&first) = buf.first() else {
        return Ok(Decoded::Incomplete);
    };

    let raw_opcode = first & OPCODE_MASK;
    let opcode = OpCode::from_u8(raw_opcode).ok_or(FrameError::UnsupportedOpcode(raw_opcode))?;

    let Some(&second) = buf.get(1) else {
        return Ok(Decoded::Incomplete);
    };

    if second & MASK_BIT == 0 {
        return Err(FrameError::ProtocolViolation);
    }

    let (payload_len, extended) = match second & LEN_MASK {
        LEN_16_MARKER => match buf.get(2..4) {
            Some(bytes) => (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 2),
            None => return Ok(Decoded::Incomplete),
        },
        LEN_64_MARKER => match buf.get(2..10) {
            Some(bytes) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let len = u64::from_be_bytes(raw);
                if len > MAX_PAYLOAD_LEN {
                    return Err(FrameError::FrameTooLarge(len));
                }
                (len, 8)
            }
            None => return Ok(Decoded::Incomplete),
        },
        len => (len as u64, 0),
    };

    if payload_len > max_payload {
        return Err(FrameError::FrameTooLarge(payload_len));
    }

    let mask_offset = 2 + extended;
    let payload_offset = mask_offset + 4;
    let total = payload_offset as u64 + payload_len;
    if (buf.len() as u64) < total {
        return Ok(Decoded::Incomplete);
    }
    // The buffer holds `total` bytes, so it fits in usize.
    let total = total as usize;

    let mut key = [0u8; 4];
    key.copy_from_slice(&buf[mask_offset..payload_offset]);

    let mut payload = buf[payload_offset..total].to_vec();
    apply_mask(&mut payload, key);

    Ok(Decoded::Complete(
        Frame {
            opcode,
            payload,
            masked: true,
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn client_frame(payload: &[u8], opcode: OpCode) -> BytesMut {
        encode_with_mask(payload, opcode, KEY).unwrap()
    }

    #[test]
    fn test_round_trip_across_length_classes() {
        for len in [0usize, 1, 125, 126, 65535, 65536, 70000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = client_frame(&payload, OpCode::Text);

            match decode(&wire).unwrap() {
                Decoded::Complete(frame, consumed) => {
                    assert_eq!(consumed, wire.len(), "length {len}");
                    assert_eq!(frame.opcode, OpCode::Text);
                    assert_eq!(frame.payload, payload, "length {len}");
                }
                Decoded::Incomplete => panic!("incomplete for length {len}"),
            }
        }
    }

    #[test]
    fn test_minimal_length_encoding() {
        let small = encode(&[b'a'; 125], OpCode::Text).unwrap();
        assert_eq!(small[0], 0x81);
        assert_eq!(small[1], 125);
        assert_eq!(small.len(), 2 + 125);

        let medium = encode(&[b'a'; 126], OpCode::Text).unwrap();
        assert_eq!(medium[1], 126);
        assert_eq!(&medium[2..4], &[0x00, 0x7E]);
        assert_eq!(medium.len(), 4 + 126);

        let large = encode(&vec![b'a'; 65536], OpCode::Binary).unwrap();
        assert_eq!(large[0], 0x82);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &65536u64.to_be_bytes());
        assert_eq!(large.len(), 10 + 65536);
    }

    #[test]
    fn test_first_byte_per_opcode() {
        assert_eq!(encode(b"", OpCode::Text).unwrap()[0], 0x81);
        assert_eq!(encode(b"", OpCode::Close).unwrap()[0], 0x88);
        assert_eq!(encode(b"", OpCode::Ping).unwrap()[0], 0x89);
        assert_eq!(encode(b"", OpCode::Pong).unwrap()[0], 0x8A);
    }

    #[test]
    fn test_masked_encoding_layout() {
        let wire = client_frame(b"Hello", OpCode::Text);
        assert_eq!(wire[1], 0x80 | 5);
        assert_eq!(&wire[2..6], &KEY);
        assert_eq!(wire[6], b'H' ^ KEY[0]);
        assert_eq!(wire[10], b'o' ^ KEY[0]);
    }

    #[test]
    fn test_random_mask_still_decodes() {
        let wire = encode_masked(b"ping me", OpCode::Ping).unwrap();
        match decode(&wire).unwrap() {
            Decoded::Complete(frame, _) => {
                assert_eq!(frame.opcode, OpCode::Ping);
                assert_eq!(frame.payload, b"ping me");
            }
            Decoded::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn test_length_with_reserved_bit_rejected() {
        let mut out = BytesMut::new();
        assert_eq!(
            put_length(&mut out, 1 << 63, 0),
            Err(FrameError::FrameTooLarge(1 << 63))
        );
        assert!(put_length(&mut out, MAX_PAYLOAD_LEN, 0).is_ok());
    }

    #[test]
    fn test_unmasked_frame_is_protocol_violation() {
        let wire = encode(b"hello", OpCode::Text).unwrap();
        assert_eq!(decode(&wire), Err(FrameError::ProtocolViolation));
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        for op in (3u8..=7).chain(11..=15) {
            let wire = [0x80 | op, 0x80, 0, 0, 0, 0];
            assert_eq!(decode(&wire), Err(FrameError::UnsupportedOpcode(op)));
        }
    }

    #[test]
    fn test_truncated_input_is_incomplete() {
        assert_eq!(decode(&[]), Ok(Decoded::Incomplete));

        let wire = client_frame(&[7u8; 300], OpCode::Binary);
        for end in 0..wire.len() {
            assert_eq!(decode(&wire[..end]), Ok(Decoded::Incomplete), "prefix {end}");
        }
    }

    #[test]
    fn test_decode_consumes_one_frame_at_a_time() {
        let mut wire = client_frame(b"first", OpCode::Text);
        wire.extend_from_slice(&client_frame(b"second", OpCode::Binary));

        let (frame, consumed) = match decode(&wire).unwrap() {
            Decoded::Complete(frame, consumed) => (frame, consumed),
            Decoded::Incomplete => panic!("incomplete"),
        };
        assert_eq!(frame.payload, b"first");

        match decode(&wire[consumed..]).unwrap() {
            Decoded::Complete(frame, rest) => {
                assert_eq!(frame.opcode, OpCode::Binary);
                assert_eq!(frame.payload, b"second");
                assert_eq!(consumed + rest, wire.len());
            }
            Decoded::Incomplete => panic!("incomplete"),
        }
    }

    #[test]
    fn test_decode_limit() {
        let wire = client_frame(&[0u8; 200], OpCode::Binary);
        assert_eq!(decode_limited(&wire, 100), Err(FrameError::FrameTooLarge(200)));
        assert!(matches!(decode_limited(&wire, 200), Ok(Decoded::Complete(..))));

        // Rejected from the header alone
        assert_eq!(
            decode_limited(&wire[..4], 100),
            Err(FrameError::FrameTooLarge(200))
        );
    }

    #[test]
    fn test_64bit_length_with_msb_rejected() {
        let mut wire = vec![0x82, 0x80 | 127];
        wire.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(decode(&wire), Err(FrameError::FrameTooLarge(1 << 63)));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(FrameError::ProtocolViolation.close_code(), 1002);
        assert_eq!(FrameError::UnsupportedOpcode(3).close_code(), 1003);
        assert_eq!(FrameError::FrameTooLarge(0).close_code(), 1004);
        assert!(FrameError::ProtocolViolation.to_string().contains("1002"));
    }
}
