// Binary frame format
//
// Packet format: [0xAA, 0x55, Length, Type, Seq, Payload..., Crc_lo, Crc_hi]
// Length counts type + seq + payload. The CRC covers length..payload.

use heapless::Vec;

use super::crc16;
use crate::config::{FRAME_HEADER, MAX_FRAME, MAX_PAYLOAD};

/// Bytes between the header and the payload: length, type, seq
const PREAMBLE: usize = 3;
const MIN_LEN: u8 = 2;
const MAX_LEN: u8 = 2 + MAX_PAYLOAD as u8;

// Host -> device types
pub const TYPE_HELLO: u8 = 0x01;
pub const TYPE_DRIVE_TWIST: u8 = 0x03;
pub const TYPE_DRIVE_TANK: u8 = 0x04;
pub const TYPE_SERVO: u8 = 0x05;
pub const TYPE_E_STOP: u8 = 0x07;
pub const TYPE_CONFIG_SET: u8 = 0x08;
pub const TYPE_MACRO_START: u8 = 0x09;
pub const TYPE_MACRO_CANCEL: u8 = 0x0A;
pub const TYPE_DIAGNOSTICS: u8 = 0x0B;
pub const TYPE_GENERIC: u8 = 0x10;

// Device -> host types
pub const TYPE_INFO: u8 = 0x81;
pub const TYPE_ACK: u8 = 0x82;

pub type Payload = Vec<u8, MAX_PAYLOAD>;
pub type FrameBytes = Vec<u8, MAX_FRAME>;

/// Error types for binary framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Missing frame sentinel")]
    BadHeader,

    #[error("Frame length {0} outside 2..={max}", max = MAX_LEN)]
    BadLength(u8),

    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    ChecksumMismatch { computed: u16, received: u16 },

    #[error("Payload of {0} bytes exceeds {max}", max = MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub seq: u8,
    pub payload: Payload,
}

impl Frame {
    pub fn new(msg_type: u8, seq: u8, payload: &[u8]) -> Result<Self, FrameError> {
        let payload =
            Vec::from_slice(payload).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
        Ok(Self {
            msg_type,
            seq,
            payload,
        })
    }

    pub fn encode(&self) -> FrameBytes {
        // Payload capacity already bounds the frame size
        let mut out = FrameBytes::new();
        write_frame(&mut out, self.msg_type, self.seq, &self.payload);
        out
    }
}

/// Build a frame from its parts.
pub fn encode(msg_type: u8, seq: u8, payload: &[u8]) -> Result<FrameBytes, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut out = FrameBytes::new();
    write_frame(&mut out, msg_type, seq, payload);
    Ok(out)
}

fn write_frame(out: &mut FrameBytes, msg_type: u8, seq: u8, payload: &[u8]) {
    let len = (2 + payload.len()) as u8;
    let _ = out.extend_from_slice(&FRAME_HEADER);
    let _ = out.extend_from_slice(&[len, msg_type, seq]);
    let _ = out.extend_from_slice(payload);
    let crc = crc16::checksum(&out[2..]);
    let _ = out.extend_from_slice(&crc.to_le_bytes());
}

/// Outcome of a decode attempt at the front of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame occupying the first `consumed` bytes
    Frame { frame: Frame, consumed: usize },
    /// The bytes so far are a valid frame prefix
    NeedMoreData,
    /// Structurally invalid; drop `skip` bytes to reach the next candidate sentinel
    Invalid { error: FrameError, skip: usize },
}

/// Index of the next possible frame start at or after `from`.
fn next_sentinel(bytes: &[u8], from: usize) -> usize {
    bytes
        .iter()
        .skip(from)
        .position(|&b| b == FRAME_HEADER[0])
        .map_or(bytes.len(), |p| p + from)
}

/// Decode one frame from the front of `bytes`.
pub fn decode_binary(bytes: &[u8]) -> Decoded {
    let Some(&first) = bytes.first() else {
        return Decoded::NeedMoreData;
    };
    if first != FRAME_HEADER[0] {
        return Decoded::Invalid {
            error: FrameError::BadHeader,
            skip: next_sentinel(bytes, 1),
        };
    }
    let Some(&second) = bytes.get(1) else {
        return Decoded::NeedMoreData;
    };
    if second != FRAME_HEADER[1] {
        return Decoded::Invalid {
            error: FrameError::BadHeader,
            skip: next_sentinel(bytes, 1),
        };
    }
    let Some(&len) = bytes.get(2) else {
        return Decoded::NeedMoreData;
    };
    if !(MIN_LEN..=MAX_LEN).contains(&len) {
        return Decoded::Invalid {
            error: FrameError::BadLength(len),
            skip: next_sentinel(bytes, 1),
        };
    }

    let body_end = 2 + 1 + len as usize;
    let total = body_end + 2;
    if bytes.len() < total {
        return Decoded::NeedMoreData;
    }

    let computed = crc16::checksum(&bytes[2..body_end]);
    let received = u16::from_le_bytes([bytes[body_end], bytes[body_end + 1]]);
    if computed != received {
        return Decoded::Invalid {
            error: FrameError::ChecksumMismatch { computed, received },
            skip: next_sentinel(bytes, 1),
        };
    }

    let mut payload = Payload::new();
    let _ = payload.extend_from_slice(&bytes[2 + PREAMBLE..body_end]);
    Decoded::Frame {
        frame: Frame {
            msg_type: bytes[3],
            seq: bytes[4],
            payload,
        },
        consumed: total,
    }
}

/// Incremental binary decoder fed one byte at a time.
///
/// Bytes are buffered until [`decode_binary`] can make a decision. On an
/// invalid frame the decoder drops bytes up to the next sentinel candidate and
/// keeps scanning from there.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: FrameBytes,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) {
        if self.buffer.push(byte).is_err() {
            // Unreachable with a validated length, but never grow
            self.buffer.clear();
        }
    }

    /// Next decode decision for the buffered bytes, if any.
    ///
    /// Call repeatedly until it returns `None`.
    pub fn next_event(&mut self) -> Option<Result<Frame, FrameError>> {
        match decode_binary(&self.buffer) {
            Decoded::NeedMoreData => None,
            Decoded::Frame { frame, consumed } => {
                self.discard(consumed);
                Some(Ok(frame))
            }
            Decoded::Invalid { error, skip } => {
                self.discard(skip);
                Some(Err(error))
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        let remaining = self.buffer.len() - n;
        self.buffer.copy_within(n.., 0);
        self.buffer.truncate(remaining);
    }
}

/// Frame sequence numbers: 1..=255, 0 is reserved.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: u8,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SequenceCounter {
    pub fn next_seq(&mut self) -> u8 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        seq
    }
}
