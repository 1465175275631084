// Normalized commands: both wire formats resolve to one Command type at the
// transport boundary so dispatch never branches on the encoding.

use core::fmt::Write as _;

use heapless::{String, Vec};

use super::frame::{self, Frame, FrameBytes};
use super::text::{Tag, TextCommand};

/// Longest single reply a handler may emit (diagnostics dumps included)
pub const REPLY_CAPACITY: usize = 320;

pub type ReplyBytes = Vec<u8, REPLY_CAPACITY>;

// Command numbers
pub const N_HELLO: u16 = 0;
pub const N_SERVO: u16 = 5;
pub const N_ULTRASONIC: u16 = 21;
pub const N_LINE_SENSOR: u16 = 22;
pub const N_BATTERY: u16 = 23;
pub const N_LEGACY_STOP: u16 = 100;
pub const N_LEGACY_STANDBY: u16 = 110;
pub const N_DIAGNOSTICS: u16 = 120;
pub const N_INIT_RERUN: u16 = 130;
pub const N_DRIVE_CONFIG: u16 = 140;
pub const N_SETPOINT: u16 = 200;
pub const N_STOP: u16 = 201;
pub const N_MACRO_START: u16 = 210;
pub const N_MACRO_CANCEL: u16 = 211;
pub const N_DIRECT: u16 = 999;

/// Binary types without a mapping normalize into this range so they reach the
/// generic acknowledge handler
const UNMAPPED_BINARY_BASE: u16 = 0x100;

/// One decoded unit from the receive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    Text(TextCommand),
}

/// Where and how a reply must be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTo {
    Text(Tag),
    Binary { msg_type: u8, seq: u8 },
}

/// What a command asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Hello,
    Servo,
    Ultrasonic,
    LineSensor,
    Battery,
    LegacyStop,
    Diagnostics,
    InitRerun,
    DriveConfig,
    Setpoint,
    Stop,
    MacroStart,
    MacroCancel,
    Direct,
    Other(u16),
}

impl CommandKind {
    pub fn from_number(n: u16) -> Self {
        match n {
            N_HELLO => Self::Hello,
            N_SERVO => Self::Servo,
            N_ULTRASONIC => Self::Ultrasonic,
            N_LINE_SENSOR => Self::LineSensor,
            N_BATTERY => Self::Battery,
            N_LEGACY_STOP | N_LEGACY_STANDBY => Self::LegacyStop,
            N_DIAGNOSTICS => Self::Diagnostics,
            N_INIT_RERUN => Self::InitRerun,
            N_DRIVE_CONFIG => Self::DriveConfig,
            N_SETPOINT => Self::Setpoint,
            N_STOP => Self::Stop,
            N_MACRO_START => Self::MacroStart,
            N_MACRO_CANCEL => Self::MacroCancel,
            N_DIRECT => Self::Direct,
            other => Self::Other(other),
        }
    }

    /// Streaming setpoints are fire-and-forget; every other command gets
    /// exactly one reply.
    pub fn expects_reply(self) -> bool {
        !matches!(self, Self::Setpoint)
    }

    /// Commands that move the drive motors.
    pub fn is_motion(self) -> bool {
        matches!(self, Self::Setpoint | Self::MacroStart | Self::Direct)
    }
}

/// Error types for frame-to-command normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Payload too short for frame type 0x{0:02X}")]
    ShortPayload(u8),
}

/// A command in normalized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub number: u16,
    pub data: [i32; 4],
    pub ttl_ms: Option<u32>,
    pub reply_to: ReplyTo,
    /// The caller's tag did not fit and was cut
    pub tag_truncated: bool,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        CommandKind::from_number(self.number)
    }

    pub fn expects_reply(&self) -> bool {
        self.kind().expects_reply()
    }

    fn binary(number: u16, frame: &Frame) -> Self {
        Self {
            number,
            data: [0; 4],
            ttl_ms: None,
            reply_to: ReplyTo::Binary {
                msg_type: frame.msg_type,
                seq: frame.seq,
            },
            tag_truncated: false,
        }
    }
}

impl From<TextCommand> for Command {
    fn from(text: TextCommand) -> Self {
        Self {
            number: text.number,
            data: text.data,
            ttl_ms: text.ttl_ms,
            reply_to: ReplyTo::Text(text.tag),
            tag_truncated: text.tag_truncated,
        }
    }
}

/// Little-endian field reader over a frame payload.
struct Fields<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl Fields<'_> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.payload.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.payload.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i16(&mut self) -> Option<i16> {
        self.u16().map(|v| v as i16)
    }
}

impl TryFrom<Frame> for Command {
    type Error = CommandError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let short = CommandError::ShortPayload(frame.msg_type);
        let mut f = Fields {
            payload: &frame.payload,
            pos: 0,
        };
        let cmd = match frame.msg_type {
            frame::TYPE_HELLO => Self::binary(N_HELLO, &frame),
            frame::TYPE_DRIVE_TWIST => {
                let mut cmd = Self::binary(N_SETPOINT, &frame);
                cmd.data[0] = f.i16().ok_or(short)?.into();
                cmd.data[1] = f.i16().ok_or(short)?.into();
                cmd.ttl_ms = f.u16().map(u32::from);
                cmd
            }
            frame::TYPE_DRIVE_TANK => {
                let mut cmd = Self::binary(N_DIRECT, &frame);
                cmd.data[0] = f.i16().ok_or(short)?.into();
                cmd.data[1] = f.i16().ok_or(short)?.into();
                cmd
            }
            frame::TYPE_SERVO => {
                let mut cmd = Self::binary(N_SERVO, &frame);
                cmd.data[0] = f.u8().ok_or(short)?.into();
                cmd
            }
            frame::TYPE_E_STOP => Self::binary(N_STOP, &frame),
            frame::TYPE_CONFIG_SET => {
                let mut cmd = Self::binary(N_DRIVE_CONFIG, &frame);
                cmd.data[0] = f.u8().ok_or(short)?.into();
                cmd.data[1] = f.i16().ok_or(short)?.into();
                cmd
            }
            frame::TYPE_MACRO_START => {
                let mut cmd = Self::binary(N_MACRO_START, &frame);
                cmd.data[0] = f.u8().ok_or(short)?.into();
                cmd.data[1] = f.u8().ok_or(short)?.into();
                cmd.ttl_ms = f.u16().map(u32::from);
                cmd
            }
            frame::TYPE_MACRO_CANCEL => Self::binary(N_MACRO_CANCEL, &frame),
            frame::TYPE_DIAGNOSTICS => Self::binary(N_DIAGNOSTICS, &frame),
            frame::TYPE_GENERIC => {
                let number = f.u16().ok_or(short)?;
                let mut cmd = Self::binary(number, &frame);
                for slot in cmd.data.iter_mut() {
                    match f.i16() {
                        Some(v) => *slot = v.into(),
                        None => break,
                    }
                }
                cmd.ttl_ms = f.u16().map(u32::from);
                cmd
            }
            other => Self::binary(UNMAPPED_BINARY_BASE | u16::from(other), &frame),
        };
        Ok(cmd)
    }
}

impl TryFrom<Inbound> for Command {
    type Error = CommandError;

    fn try_from(inbound: Inbound) -> Result<Self, Self::Error> {
        match inbound {
            Inbound::Frame(frame) => Command::try_from(frame),
            Inbound::Text(text) => Ok(Command::from(text)),
        }
    }
}

/// Reply status byte / text suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    False = 0,
    Ok = 1,
    True = 2,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Self::False => "false",
            Self::Ok => "ok",
            Self::True => "true",
        }
    }
}

/// Encode a reply in the encoding the command arrived with.
///
/// Text: `{tag_ok}`, `{tag_false}`, `{tag_true}` or `{tag_<value>}` when a
/// value is given. Binary: an ACK frame echoing the sequence with payload
/// `[status, command type, value_le32?]`.
pub fn encode_response(reply_to: &ReplyTo, status: Status, value: Option<i32>) -> ReplyBytes {
    match reply_to {
        ReplyTo::Text(tag) => {
            let mut line: String<48> = String::new();
            let _ = line.push('{');
            if !tag.is_empty() {
                let _ = write!(line, "{}_", tag);
            }
            let _ = match value {
                Some(v) => write!(line, "{}", v),
                None => line.push_str(status.as_str()).map_err(|_| core::fmt::Error),
            };
            let _ = line.push_str("}\n");
            let mut out = ReplyBytes::new();
            let _ = out.extend_from_slice(line.as_bytes());
            out
        }
        ReplyTo::Binary { msg_type, seq } => {
            let mut payload: Vec<u8, 6> = Vec::new();
            let _ = payload.push(status as u8);
            let _ = payload.push(*msg_type);
            if let Some(v) = value {
                let _ = payload.extend_from_slice(&v.to_le_bytes());
            }
            binary_reply(frame::TYPE_ACK, *seq, &payload)
        }
    }
}

/// Encode a raw binary reply frame of the given type.
pub fn binary_reply(msg_type: u8, seq: u8, payload: &[u8]) -> ReplyBytes {
    let mut out = ReplyBytes::new();
    if let Ok(bytes) = frame::encode(msg_type, seq, payload) {
        let bytes: FrameBytes = bytes;
        let _ = out.extend_from_slice(&bytes);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Decoded, decode_binary};
    use crate::protocol::text::decode_text;

    fn text(line: &str) -> Command {
        Command::from(decode_text(line.as_bytes()).unwrap())
    }

    #[test]
    fn test_setpoint_is_fire_and_forget() {
        let cmd = text(r#"{"N":200,"D1":100,"T":200}"#);
        assert_eq!(cmd.kind(), CommandKind::Setpoint);
        assert!(!cmd.expects_reply());
        assert!(text(r#"{"N":201}"#).expects_reply());
        assert!(text(r#"{"N":42}"#).expects_reply());
    }

    #[test]
    fn test_twist_frame_normalizes_like_text() {
        let mut payload = [0u8; 6];
        payload[..2].copy_from_slice(&150i16.to_le_bytes());
        payload[2..4].copy_from_slice(&(-20i16).to_le_bytes());
        payload[4..].copy_from_slice(&250u16.to_le_bytes());
        let frame = Frame::new(frame::TYPE_DRIVE_TWIST, 4, &payload).unwrap();
        let cmd = Command::try_from(Inbound::Frame(frame)).unwrap();
        let from_text = text(r#"{"N":200,"D1":150,"D2":-20,"T":250}"#);
        assert_eq!(cmd.number, from_text.number);
        assert_eq!(cmd.data, from_text.data);
        assert_eq!(cmd.ttl_ms, from_text.ttl_ms);
        assert_eq!(
            cmd.reply_to,
            ReplyTo::Binary {
                msg_type: frame::TYPE_DRIVE_TWIST,
                seq: 4
            }
        );
    }

    #[test]
    fn test_short_payload_rejected() {
        let frame = Frame::new(frame::TYPE_DRIVE_TANK, 1, &[1, 0]).unwrap();
        assert_eq!(
            Command::try_from(frame),
            Err(CommandError::ShortPayload(frame::TYPE_DRIVE_TANK))
        );
    }

    #[test]
    fn test_generic_frame_prefix() {
        let mut payload = [0u8; 4];
        payload[..2].copy_from_slice(&21u16.to_le_bytes());
        payload[2..].copy_from_slice(&2i16.to_le_bytes());
        let frame = Frame::new(frame::TYPE_GENERIC, 9, &payload).unwrap();
        let cmd = Command::try_from(frame).unwrap();
        assert_eq!(cmd.kind(), CommandKind::Ultrasonic);
        assert_eq!(cmd.data, [2, 0, 0, 0]);
        assert_eq!(cmd.ttl_ms, None);
    }

    #[test]
    fn test_unmapped_frame_routes_to_generic() {
        let frame = Frame::new(0x06, 2, &[1, 2, 3]).unwrap();
        let cmd = Command::try_from(frame).unwrap();
        assert!(matches!(cmd.kind(), CommandKind::Other(_)));
    }

    #[test]
    fn test_text_responses() {
        let mut tag = Tag::new();
        let _ = tag.push_str("b9");
        let to = ReplyTo::Text(tag);
        assert_eq!(&encode_response(&to, Status::Ok, None)[..], b"{b9_ok}\n");
        assert_eq!(&encode_response(&to, Status::False, None)[..], b"{b9_false}\n");
        assert_eq!(&encode_response(&to, Status::Ok, Some(37))[..], b"{b9_37}\n");
        let untagged = ReplyTo::Text(Tag::new());
        assert_eq!(&encode_response(&untagged, Status::Ok, None)[..], b"{ok}\n");
    }

    #[test]
    fn test_binary_response_echoes_sequence() {
        let to = ReplyTo::Binary {
            msg_type: frame::TYPE_SERVO,
            seq: 77,
        };
        let bytes = encode_response(&to, Status::Ok, None);
        match decode_binary(&bytes) {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.msg_type, frame::TYPE_ACK);
                assert_eq!(frame.seq, 77);
                assert_eq!(&frame.payload[..], &[Status::Ok as u8, frame::TYPE_SERVO]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
