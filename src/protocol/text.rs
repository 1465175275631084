// Line-delimited text command format
//
// Command: {"N":200,"H":"b12","D1":150,"D2":-40,"T":200}\n
// Reply:   {b12_ok}\n, {b12_false}\n, {b12_true}\n, {b12_<value>}\n
//
// Fields: N (required), H (tag string), D1..D4 (integers), T (ttl ms).
// Tags longer than the fixed capacity are truncated and flagged.

use heapless::String;

use crate::config::MAX_TAG_LEN;

pub type Tag = String<MAX_TAG_LEN>;

/// Error types for text command parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("Command object is malformed at byte {0}")]
    Malformed(usize),

    #[error("Unknown field in command object")]
    UnknownField,

    #[error("Field appears more than once")]
    DuplicateField,

    #[error("Command number (N) is missing")]
    MissingCommandNumber,

    #[error("Numeric field out of range")]
    BadNumber,
}

/// A parsed text command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextCommand {
    pub number: u16,
    pub tag: Tag,
    /// The supplied tag exceeded capacity and was cut
    pub tag_truncated: bool,
    pub data: [i32; 4],
    pub ttl_ms: Option<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    N,
    H,
    D(usize),
    T,
}

impl Field {
    fn parse(name: &[u8]) -> Option<Self> {
        match name {
            b"N" => Some(Self::N),
            b"H" => Some(Self::H),
            b"D1" => Some(Self::D(0)),
            b"D2" => Some(Self::D(1)),
            b"D3" => Some(Self::D(2)),
            b"D4" => Some(Self::D(3)),
            b"T" => Some(Self::T),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::N => 1 << 0,
            Self::H => 1 << 1,
            Self::D(i) => 1 << (2 + i),
            Self::T => 1 << 6,
        }
    }
}

enum Value<'a> {
    Int(i64),
    Str(&'a [u8]),
}

/// Byte cursor over one command object.
struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), TextError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(TextError::Malformed(self.pos))
        }
    }

    fn string(&mut self) -> Result<&'a [u8], TextError> {
        self.expect(b'"')?;
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            match b {
                b'"' => {
                    let s = &self.bytes[start..self.pos];
                    self.pos += 1;
                    return Ok(s);
                }
                b'{' | b'}' | b'\\' => return Err(TextError::Malformed(self.pos)),
                0x20..=0x7E => self.pos += 1,
                _ => return Err(TextError::Malformed(self.pos)),
            }
        }
        Err(TextError::Malformed(self.pos))
    }

    fn integer(&mut self) -> Result<i64, TextError> {
        self.skip_ws();
        let start = self.pos;
        if self.bytes.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        let digits = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if self.pos == digits || self.pos - digits > 10 {
            return Err(TextError::Malformed(start));
        }
        let mut value: i64 = 0;
        for &d in &self.bytes[digits..self.pos] {
            value = value * 10 + i64::from(d - b'0');
        }
        Ok(if digits > start { -value } else { value })
    }

    fn value(&mut self) -> Result<Value<'a>, TextError> {
        match self.peek() {
            Some(b'"') => self.string().map(Value::Str),
            Some(b'-' | b'0'..=b'9') => self.integer().map(Value::Int),
            _ => Err(TextError::Malformed(self.pos)),
        }
    }
}

/// Parse one command line (delimiter already stripped).
pub fn decode_text(line: &[u8]) -> Result<TextCommand, TextError> {
    let mut sc = Scanner {
        bytes: line,
        pos: 0,
    };
    let mut cmd = TextCommand::default();
    let mut seen = 0u8;

    sc.expect(b'{')?;
    if sc.peek() == Some(b'}') {
        return Err(TextError::MissingCommandNumber);
    }
    loop {
        let name = sc.string()?;
        let field = Field::parse(name).ok_or(TextError::UnknownField)?;
        if seen & field.bit() != 0 {
            return Err(TextError::DuplicateField);
        }
        seen |= field.bit();
        sc.expect(b':')?;
        match (field, sc.value()?) {
            (Field::N, Value::Int(n)) => {
                cmd.number = u16::try_from(n).map_err(|_| TextError::BadNumber)?;
            }
            (Field::H, Value::Str(s)) => {
                for &b in s.iter().take(MAX_TAG_LEN) {
                    let _ = cmd.tag.push(b as char);
                }
                cmd.tag_truncated = s.len() > MAX_TAG_LEN;
            }
            (Field::D(i), Value::Int(n)) => {
                cmd.data[i] = i32::try_from(n).map_err(|_| TextError::BadNumber)?;
            }
            (Field::T, Value::Int(n)) => {
                cmd.ttl_ms = Some(u32::try_from(n).map_err(|_| TextError::BadNumber)?);
            }
            _ => return Err(TextError::Malformed(sc.pos)),
        }
        match sc.peek() {
            Some(b',') => sc.pos += 1,
            Some(b'}') => {
                sc.pos += 1;
                break;
            }
            _ => return Err(TextError::Malformed(sc.pos)),
        }
    }
    if sc.peek().is_some() {
        return Err(TextError::Malformed(sc.pos));
    }
    if seen & Field::N.bit() == 0 {
        return Err(TextError::MissingCommandNumber);
    }
    Ok(cmd)
}

/// A tagged reply line as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextReply<'a> {
    pub tag: &'a str,
    pub body: &'a str,
}

impl TextReply<'_> {
    /// `false` replies are failures, anything else is a success with a body
    pub fn is_ok(&self) -> bool {
        self.body != "false"
    }
}

/// Split a reply line `{tag_body}` into its tag and body.
///
/// Untagged lines (boot marker, `{ok}`, `{stats:...}`) return `None`.
pub fn parse_reply(line: &str) -> Option<TextReply<'_>> {
    let inner = line.trim().strip_prefix('{')?.strip_suffix('}')?;
    let (tag, body) = inner.split_once('_')?;
    if tag.is_empty() || body.is_empty() || tag.contains([':', ',', '=']) {
        return None;
    }
    Some(TextReply { tag, body })
}
