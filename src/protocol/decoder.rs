// Streaming receive decoder
//
// Bytes arrive one at a time from the serial receiver. The first byte of each
// unit selects the format: the frame sentinel starts a binary frame, an
// opening brace starts a text line. Anything else between units is line noise
// and is ignored.

use heapless::Vec;

use super::command::Inbound;
use super::frame::{FrameDecoder, FrameError};
use super::text::{TextError, decode_text};
use crate::config::{FRAME_HEADER, MAX_TEXT_LINE, TEXT_MARKER};

/// Error types for the receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("Frame rejected: {0}")]
    Frame(#[from] FrameError),

    #[error("Text command rejected: {0}")]
    Text(#[from] TextError),

    #[error("Text line exceeds {max} bytes", max = MAX_TEXT_LINE)]
    LineTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Binary,
    Text,
    /// Oversize line; skipping to the next delimiter
    Discard,
}

/// Auto-detecting decoder for the dual wire format.
///
/// Feed bytes with [`push`](Self::push) and drain with
/// [`next_event`](Self::next_event) after every push.
#[derive(Debug)]
pub struct WireDecoder {
    mode: Mode,
    frames: FrameDecoder,
    line: Vec<u8, MAX_TEXT_LINE>,
    ready: Option<Result<Inbound, WireError>>,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self {
            mode: Mode::Idle,
            frames: FrameDecoder::new(),
            line: Vec::new(),
            ready: None,
        }
    }
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) {
        match self.mode {
            Mode::Idle => {
                if byte == FRAME_HEADER[0] {
                    self.frames.push(byte);
                    self.mode = Mode::Binary;
                } else if byte == TEXT_MARKER {
                    self.line.clear();
                    let _ = self.line.push(byte);
                    self.mode = Mode::Text;
                }
            }
            Mode::Binary => self.frames.push(byte),
            Mode::Text => self.push_text(byte),
            Mode::Discard => {
                if is_delimiter(byte) {
                    self.mode = Mode::Idle;
                }
            }
        }
    }

    fn push_text(&mut self, byte: u8) {
        if is_delimiter(byte) {
            self.mode = Mode::Idle;
            self.ready = Some(
                decode_text(&self.line)
                    .map(Inbound::Text)
                    .map_err(WireError::from),
            );
            self.line.clear();
        } else if self.line.push(byte).is_err() {
            self.line.clear();
            self.mode = Mode::Discard;
            self.ready = Some(Err(WireError::LineTooLong));
        }
    }

    /// Next decoded unit or counted error, if one is complete.
    pub fn next_event(&mut self) -> Option<Result<Inbound, WireError>> {
        if let Some(event) = self.ready.take() {
            return Some(event);
        }
        if self.mode != Mode::Binary {
            return None;
        }
        loop {
            let event = self.frames.next_event();
            if self.frames.is_empty() {
                self.mode = Mode::Idle;
            }
            match event? {
                Ok(frame) => return Some(Ok(Inbound::Frame(frame))),
                // Noise after a rejected frame, already skipped
                Err(FrameError::BadHeader) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    /// Drop any partial unit, e.g. after a restart.
    pub fn reset(&mut self) {
        self.mode = Mode::Idle;
        self.frames.reset();
        self.line.clear();
        self.ready = None;
    }
}

fn is_delimiter(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}
