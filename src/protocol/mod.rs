// Wire protocol shared by the device firmware and the host bridge
//
// Provides:
// - CRC16-CCITT checksum
// - Binary checksummed frames with sequence numbers
// - Line-delimited text commands and tagged replies
// - Normalized commands and reply encoding
// - Streaming decoder that auto-detects the format by leading byte

pub mod command;
pub mod crc16;
pub mod decoder;
pub mod frame;
pub mod text;

pub use command::{Command, CommandError, CommandKind, Inbound, ReplyTo, Status, encode_response};
pub use decoder::{WireDecoder, WireError};
pub use frame::{Decoded, Frame, FrameDecoder, FrameError, SequenceCounter, decode_binary};
pub use text::{TextCommand, TextError, TextReply, decode_text, parse_reply};
