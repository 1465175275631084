// Diagnostic counters and the state dump returned by the diagnostics command

use core::fmt::Write as _;

use heapless::String;

use super::drive_limits::BatteryClass;
use super::init_sequence::InitState;
use super::motion::MotionOwner;
use crate::config::HARDWARE_PROFILE;
use crate::protocol::command::{REPLY_CAPACITY, ReplyBytes};

/// Monotonic event counts. Reset only by a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounters {
    rx_overflow: u32,
    dropped_long: u32,
    parse_errors: u32,
    crc_failures: u32,
    tx_dropped: u32,
    rate_limited: u32,
    rejected: u32,
    last_cmd_ms: Option<u32>,
}

impl DiagnosticCounters {
    pub(crate) fn rx_overflow(&mut self) {
        self.rx_overflow = self.rx_overflow.saturating_add(1);
    }

    pub(crate) fn dropped_long(&mut self) {
        self.dropped_long = self.dropped_long.saturating_add(1);
    }

    pub(crate) fn parse_error(&mut self) {
        self.parse_errors = self.parse_errors.saturating_add(1);
    }

    pub(crate) fn crc_failure(&mut self) {
        self.crc_failures = self.crc_failures.saturating_add(1);
    }

    pub(crate) fn tx_dropped(&mut self) {
        self.tx_dropped = self.tx_dropped.saturating_add(1);
    }

    pub(crate) fn rate_limited(&mut self) {
        self.rate_limited = self.rate_limited.saturating_add(1);
    }

    pub(crate) fn rejected(&mut self) {
        self.rejected = self.rejected.saturating_add(1);
    }

    pub(crate) fn command_accepted(&mut self, now_ms: u32) {
        self.last_cmd_ms = Some(now_ms);
    }

    pub fn rx_overflow_count(&self) -> u32 {
        self.rx_overflow
    }

    pub fn dropped_long_count(&self) -> u32 {
        self.dropped_long
    }

    pub fn parse_error_count(&self) -> u32 {
        self.parse_errors
    }

    pub fn crc_failure_count(&self) -> u32 {
        self.crc_failures
    }

    pub fn tx_dropped_count(&self) -> u32 {
        self.tx_dropped
    }

    pub fn rate_limited_count(&self) -> u32 {
        self.rate_limited
    }

    pub fn rejected_count(&self) -> u32 {
        self.rejected
    }

    /// Milliseconds since the last accepted command, 0 if none yet
    pub fn ms_since_command(&self, now_ms: u32) -> u32 {
        self.last_cmd_ms.map_or(0, |t| now_ms.wrapping_sub(t))
    }
}

/// Everything the diagnostics command reports, captured at one instant.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub owner: MotionOwner,
    pub left: i16,
    pub right: i16,
    pub driver_enabled: bool,
    pub macro_step: Option<(u8, u8)>,
    pub reset_count: u16,
    pub imu: bool,
    pub battery_mv: Option<u16>,
    pub battery: BatteryClass,
    pub max_pwm: u8,
    pub deadband: (u8, u8),
    pub ramp: (u8, u8),
    pub kick: bool,
    pub init: InitState,
    pub init_warn: u8,
    pub counters: DiagnosticCounters,
    pub now_ms: u32,
}

type Line = String<REPLY_CAPACITY>;

impl Snapshot {
    /// Two text lines: the state dump and the counters, each prefixed with
    /// the caller's tag when there is one.
    ///
    /// `{b7_diag:owner=S,l=120,r=120,stby=1,...}`
    /// `{b7_stats:rx=0,jd=0,pe=0,crc=0,tx=0,rl=0,rj=0,ms=12}`
    pub fn to_text(&self, tag: &str) -> ReplyBytes {
        let mut line = Line::new();
        // Capacity covers both lines with the longest tag
        let _ = self.write_text(&mut line, tag);
        let mut out = ReplyBytes::new();
        let _ = out.extend_from_slice(line.as_bytes());
        out
    }

    fn write_text(&self, out: &mut Line, tag: &str) -> core::fmt::Result {
        let prefix = |out: &mut Line| -> core::fmt::Result {
            out.push('{').map_err(|_| core::fmt::Error)?;
            if !tag.is_empty() {
                write!(out, "{}_", tag)?;
            }
            Ok(())
        };
        prefix(out)?;
        write!(
            out,
            "diag:owner={},l={},r={},stby={},",
            self.owner.code(),
            self.left,
            self.right,
            u8::from(self.driver_enabled)
        )?;
        match self.macro_step {
            Some((id, step)) => write!(out, "macro={}/{},", id, step)?,
            None => write!(out, "macro=0,")?,
        }
        write!(
            out,
            "reset={},hw={},imu={},batt={},b={},cap={},db={}/{},ramp={}/{},kick={},init={},warn={}}}\n",
            self.reset_count,
            HARDWARE_PROFILE,
            u8::from(self.imu),
            self.battery_mv.unwrap_or(0),
            self.battery as u8,
            self.max_pwm,
            self.deadband.0,
            self.deadband.1,
            self.ramp.0,
            self.ramp.1,
            u8::from(self.kick),
            self.init as u8,
            self.init_warn
        )?;
        prefix(out)?;
        let c = &self.counters;
        write!(
            out,
            "stats:rx={},jd={},pe={},crc={},tx={},rl={},rj={},ms={}}}\n",
            c.rx_overflow,
            c.dropped_long,
            c.parse_errors,
            c.crc_failures,
            c.tx_dropped,
            c.rate_limited,
            c.rejected,
            c.ms_since_command(self.now_ms)
        )
    }

    /// Packed little-endian payload for the binary INFO reply.
    pub fn to_payload(&self) -> heapless::Vec<u8, 48> {
        let mut p = heapless::Vec::new();
        let c = &self.counters;
        let (macro_id, macro_step) = self.macro_step.unwrap_or((0, 0));
        let small = |v: u32| (v.min(u32::from(u16::MAX)) as u16).to_le_bytes();
        let _ = p.push(self.owner.code() as u8);
        let _ = p.extend_from_slice(&self.left.to_le_bytes());
        let _ = p.extend_from_slice(&self.right.to_le_bytes());
        let _ = p.extend_from_slice(&[u8::from(self.driver_enabled), macro_id, macro_step]);
        let _ = p.extend_from_slice(&self.reset_count.to_le_bytes());
        let _ = p.push(u8::from(self.imu));
        let _ = p.extend_from_slice(&self.battery_mv.unwrap_or(0).to_le_bytes());
        let _ = p.extend_from_slice(&[
            self.battery as u8,
            self.max_pwm,
            self.deadband.0,
            self.deadband.1,
            self.ramp.0,
            self.ramp.1,
            u8::from(self.kick),
            self.init as u8,
            self.init_warn,
        ]);
        for count in [
            c.rx_overflow,
            c.dropped_long,
            c.parse_errors,
            c.crc_failures,
            c.tx_dropped,
            c.rate_limited,
            c.rejected,
        ] {
            let _ = p.extend_from_slice(&small(count));
        }
        let _ = p.extend_from_slice(&c.ms_since_command(self.now_ms).to_le_bytes());
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::text::parse_reply;

    fn snapshot() -> Snapshot {
        let mut counters = DiagnosticCounters::default();
        counters.crc_failure();
        counters.parse_error();
        counters.parse_error();
        counters.command_accepted(1000);
        Snapshot {
            owner: MotionOwner::Setpoint,
            left: 120,
            right: -40,
            driver_enabled: true,
            macro_step: None,
            reset_count: 3,
            imu: false,
            battery_mv: Some(7810),
            battery: BatteryClass::Ok,
            max_pwm: 255,
            deadband: (55, 55),
            ramp: (12, 20),
            kick: true,
            init: InitState::Done,
            init_warn: 0,
            counters,
            now_ms: 1250,
        }
    }

    #[test]
    fn test_counters_only_grow() {
        let mut counters = DiagnosticCounters::default();
        counters.tx_dropped();
        counters.tx_dropped();
        counters.rx_overflow();
        assert_eq!(counters.tx_dropped_count(), 2);
        assert_eq!(counters.rx_overflow_count(), 1);
        assert_eq!(counters.ms_since_command(500), 0);
        counters.command_accepted(400);
        assert_eq!(counters.ms_since_command(500), 100);
    }

    #[test]
    fn test_text_dump() {
        let bytes = snapshot().to_text("b7");
        let text = core::str::from_utf8(&bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("{b7_diag:owner=S,l=120,r=-40,stby=1,macro=0,reset=3,"));
        assert!(lines[0].contains("hw=uno-tb6612-v11"));
        assert!(lines[0].contains("db=55/55,ramp=12/20,kick=1,init=2,warn=0}"));
        assert_eq!(lines[1], "{b7_stats:rx=0,jd=0,pe=2,crc=1,tx=0,rl=0,rj=0,ms=250}");
        let reply = parse_reply(lines[1]).unwrap();
        assert_eq!(reply.tag, "b7");
    }

    #[test]
    fn test_untagged_dump() {
        let bytes = snapshot().to_text("");
        let text = core::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("{diag:owner=S"));
        assert!(text.contains("\n{stats:rx=0"));
    }

    #[test]
    fn test_longest_tag_fits() {
        let mut snap = snapshot();
        snap.left = -255;
        snap.right = -255;
        snap.battery_mv = Some(65535);
        let bytes = snap.to_text("abcdefghijk");
        assert!(bytes.ends_with(b"}\n"));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 2);
    }

    #[test]
    fn test_binary_payload() {
        let payload = snapshot().to_payload();
        assert_eq!(payload.len(), 40);
        assert_eq!(payload[0], b'S');
        assert_eq!(i16::from_le_bytes([payload[1], payload[2]]), 120);
        assert_eq!(i16::from_le_bytes([payload[3], payload[4]]), -40);
        let ms = u32::from_le_bytes([payload[36], payload[37], payload[38], payload[39]]);
        assert_eq!(ms, 250);
    }
}
