// Socket protocol message types
//
// Newline-delimited JSON objects, tagged by "type".

use serde::{Deserialize, Serialize};

use super::BridgeError;
use crate::config::MAX_TAG_LEN;
use crate::protocol::command::CommandKind;

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// A wire command as clients write it: the same field names the device uses.
/// Zero data fields are left out of the line; the device defaults them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommand {
    #[serde(rename = "N")]
    pub n: u16,
    /// Correlation tag. Set by the bridge; a client's own value is replaced.
    #[serde(rename = "H", default, skip_serializing_if = "String::is_empty")]
    pub h: String,
    #[serde(rename = "D1", default, skip_serializing_if = "is_zero")]
    pub d1: i32,
    #[serde(rename = "D2", default, skip_serializing_if = "is_zero")]
    pub d2: i32,
    #[serde(rename = "D3", default, skip_serializing_if = "is_zero")]
    pub d3: i32,
    #[serde(rename = "D4", default, skip_serializing_if = "is_zero")]
    pub d4: i32,
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub t: Option<u32>,
}

impl WireCommand {
    pub fn new(n: u16) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }

    /// Setpoints never get a reply, whatever the client asked for.
    pub fn expects_reply(&self) -> bool {
        CommandKind::from_number(self.n).expects_reply()
    }

    /// Encode as a newline-terminated text command line carrying `tag`.
    pub fn to_line(&self, tag: &str) -> Result<String, BridgeError> {
        let tagged = Self {
            // A longer tag is cut like the device would
            h: tag.chars().take(MAX_TAG_LEN).collect(),
            ..self.clone()
        };
        let mut line = serde_json::to_string(&tagged)?;
        line.push('\n');
        Ok(line)
    }
}

/// Client -> bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Pass a command through to the device
    Command {
        id: String,
        cmd: WireCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_reply: Option<bool>,
    },
    /// Start (or replace) the streaming setpoint loop
    StreamStart {
        id: String,
        v: i32,
        w: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate_hz: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u32>,
    },
    /// Change the velocity of the running loop
    StreamUpdate { id: String, v: i32, w: i32 },
    /// Halt the loop and stop the robot
    StreamStop { id: String },
    /// Ask for a status message
    Status { id: String },
}

impl ClientMessage {
    pub fn id(&self) -> &str {
        match self {
            Self::Command { id, .. }
            | Self::StreamStart { id, .. }
            | Self::StreamUpdate { id, .. }
            | Self::StreamStop { id }
            | Self::Status { id } => id,
        }
    }
}

/// Link health, shared by status messages and the health endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub ready: bool,
    pub device_resets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_lines: u64,
    pub pending: usize,
    pub timeouts: u64,
    pub streaming: bool,
    /// Unix ms of the last byte from the device, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rx_ms: Option<u64>,
}

/// Bridge -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of a request that produces no device reply
    Ack {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Device reply to a passthrough command, tag stripped
    Reply {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Bridge and link status
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(flatten)]
        status: LinkStatus,
        ts_ms: u64,
    },
    /// Unsolicited device output, republished as-is
    Line { line: String, ts_ms: u64 },
    /// The client sent something unparseable
    Error { message: String },
}

impl ServerMessage {
    pub fn ack(id: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::Ack {
                id: id.to_string(),
                ok: true,
                error: None,
            },
            Err(e) => Self::Ack {
                id: id.to_string(),
                ok: false,
                error: Some(e),
            },
        }
    }
}

/// Milliseconds since the Unix epoch, for message timestamps
pub fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
