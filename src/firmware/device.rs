// The device: every firmware component wired to one scheduler
//
// Bytes from the serial link are queued by `receive`, the scheduler drains
// them at the protocol rate, and replies are queued for `drain_output`. All
// state lives here and is only touched from `poll`, one task at a time.

use core::fmt::Write as _;

use heapless::{Deque, String, Vec};
use tracing::{debug, info, warn};

use super::diagnostics::DiagnosticCounters;
use super::hal::{Actuators, PinBank};
use super::init_sequence::InitSequence;
use super::motion::{MotionController, TickOutcome};
use super::router::{RouterContext, dispatch};
use super::safety::{Admission, SafetyLayer};
use super::scheduler::{MAX_TASKS, Scheduler, TaskId};
use super::sensors::{SensorCache, SensorSuite};
use crate::config::{HARDWARE_PROFILE, RX_BYTES_PER_PASS, RX_QUEUE_CAPACITY, TX_QUEUE_CAPACITY};
use crate::protocol::command::{Command, Inbound};
use crate::protocol::decoder::{WireDecoder, WireError};
use crate::protocol::frame::FrameError;

/// First line after every (re)start
pub const BOOT_MARKER: &str = "R";

pub struct Device<P: PinBank, S: SensorSuite> {
    motion: MotionController<P>,
    sensor_hw: S,
    sensors: SensorCache,
    safety: SafetyLayer,
    init: InitSequence,
    scheduler: Scheduler,
    decoder: WireDecoder,
    counters: DiagnosticCounters,
    rx: Deque<u8, RX_QUEUE_CAPACITY>,
    tx: Deque<u8, TX_QUEUE_CAPACITY>,
    reset_count: u16,
}

impl<P: PinBank, S: SensorSuite> Device<P, S> {
    /// Power on: safe pin state, boot lines queued, init sequence started.
    pub fn new(pins: P, sensor_hw: S, now_ms: u32) -> Self {
        let mut device = Self {
            motion: MotionController::new(Actuators::new(pins)),
            sensor_hw,
            sensors: SensorCache::new(),
            safety: SafetyLayer::new(now_ms),
            init: InitSequence::new(),
            scheduler: Scheduler::new(),
            decoder: WireDecoder::new(),
            counters: DiagnosticCounters::default(),
            rx: Deque::new(),
            tx: Deque::new(),
            reset_count: 0,
        };
        device.boot(now_ms);
        device
    }

    fn boot(&mut self, now_ms: u32) {
        self.queue_output(BOOT_MARKER.as_bytes());
        self.queue_output(b"\n");

        self.sensors.poll(&mut self.sensor_hw, now_ms);
        self.motion.update_battery(self.sensors.battery_mv());
        let mut line: String<64> = String::new();
        let _ = writeln!(
            line,
            "HW:{} imu={} batt={}",
            HARDWARE_PROFILE,
            u8::from(self.sensors.imu_present()),
            self.sensors.battery_mv().unwrap_or(0)
        );
        self.queue_output(line.as_bytes());

        self.init.start(now_ms, &self.sensors);
        info!("Device booted (reset count {})", self.reset_count);
    }

    /// Full restart, as the hardware watchdog would do. Only the reset count
    /// survives.
    pub fn restart(&mut self, now_ms: u32) {
        self.reset_count = self.reset_count.wrapping_add(1);
        self.motion.restart();
        self.safety = SafetyLayer::new(now_ms);
        self.init = InitSequence::new();
        self.scheduler.reset();
        self.decoder.reset();
        self.counters = DiagnosticCounters::default();
        self.rx.clear();
        self.tx.clear();
        self.boot(now_ms);
    }

    /// Bytes arriving from the link. Bytes past the queue capacity are lost;
    /// returns how many were accepted.
    pub fn receive(&mut self, bytes: &[u8]) -> usize {
        let mut accepted = 0;
        for &b in bytes {
            if self.rx.push_back(b).is_err() {
                self.counters.rx_overflow();
                warn!("Receive queue overflow, {} bytes lost", bytes.len() - accepted);
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// One pass of the main loop.
    pub fn poll(&mut self, now_ms: u32) {
        if self.safety.watchdog_expired(now_ms) {
            self.restart(now_ms);
            return;
        }
        let mut due: Vec<TaskId, MAX_TASKS> = Vec::new();
        self.scheduler.run_pending(now_ms, |id| {
            let _ = due.push(id);
        });
        for id in due {
            match id {
                TaskId::ProtocolRx => self.task_protocol_rx(now_ms),
                TaskId::Control => self.task_control(now_ms),
                TaskId::SensorsSlow => self.task_sensors(now_ms),
            }
        }
    }

    fn task_protocol_rx(&mut self, now_ms: u32) {
        for _ in 0..RX_BYTES_PER_PASS {
            let Some(byte) = self.rx.pop_front() else {
                break;
            };
            self.decoder.push(byte);
            while let Some(event) = self.decoder.next_event() {
                match event {
                    Ok(inbound) => self.handle_inbound(inbound, now_ms),
                    Err(e) => self.count_wire_error(e),
                }
            }
        }
    }

    fn count_wire_error(&mut self, e: WireError) {
        debug!("{}", e);
        match e {
            WireError::Frame(FrameError::ChecksumMismatch { .. }) => self.counters.crc_failure(),
            WireError::LineTooLong => self.counters.dropped_long(),
            WireError::Frame(_) | WireError::Text(_) => self.counters.parse_error(),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound, now_ms: u32) {
        let cmd = match Command::try_from(inbound) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("{}", e);
                self.counters.parse_error();
                return;
            }
        };
        if self.safety.admit(cmd.number, now_ms) == Admission::RateLimited {
            self.counters.rate_limited();
            return;
        }
        self.counters.command_accepted(now_ms);
        let reply = dispatch(
            &cmd,
            RouterContext {
                motion: &mut self.motion,
                sensors: &self.sensors,
                init: &mut self.init,
                counters: &mut self.counters,
                reset_count: self.reset_count,
                now_ms,
            },
        );
        if let Some(bytes) = reply {
            self.queue_output(&bytes);
        }
    }

    fn task_control(&mut self, now_ms: u32) {
        self.safety.feed_watchdog(now_ms);
        if self.init.is_running() {
            self.init.tick(now_ms, &mut self.motion, &self.sensors);
            return;
        }
        match self.motion.tick(now_ms, !self.safety.outputs_locked()) {
            TickOutcome::MacroCompleted => debug!("Macro completed"),
            TickOutcome::MacroExpired => debug!("Macro TTL expired"),
            TickOutcome::SetpointExpired | TickOutcome::Running => {}
        }
    }

    fn task_sensors(&mut self, now_ms: u32) {
        self.sensors.poll(&mut self.sensor_hw, now_ms);
        self.motion.update_battery(self.sensors.battery_mv());
    }

    /// Queue a whole reply or nothing.
    fn queue_output(&mut self, bytes: &[u8]) {
        if self.tx.capacity() - self.tx.len() < bytes.len() {
            self.counters.tx_dropped();
            return;
        }
        for &b in bytes {
            let _ = self.tx.push_back(b);
        }
    }

    /// Move queued output into `out`; returns the byte count.
    pub fn drain_output(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.tx.pop_front() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Room left in the receive queue
    pub fn rx_free(&self) -> usize {
        self.rx.capacity() - self.rx.len()
    }

    pub fn motion(&self) -> &MotionController<P> {
        &self.motion
    }

    pub fn counters(&self) -> &DiagnosticCounters {
        &self.counters
    }

    pub fn init(&self) -> &InitSequence {
        &self.init
    }

    pub fn outputs_locked(&self) -> bool {
        self.safety.outputs_locked()
    }

    pub fn reset_count(&self) -> u16 {
        self.reset_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::hal::SimPins;
    use crate::firmware::motion::MotionOwner;
    use crate::firmware::sensors::SimSensors;
    use crate::protocol::frame::{self, Decoded, Frame, decode_binary};

    type SimDevice = Device<SimPins, SimSensors>;

    fn drain(device: &mut SimDevice) -> std::string::String {
        let mut buf = [0u8; TX_QUEUE_CAPACITY];
        let n = device.drain_output(&mut buf);
        std::string::String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    /// Boot and let the init sequence finish.
    fn booted() -> (SimDevice, u32) {
        let mut device = Device::new(SimPins::default(), SimSensors::default(), 0);
        let mut now = 0;
        while device.init().is_running() {
            device.poll(now);
            now += 1;
        }
        drain(&mut device);
        (device, now)
    }

    fn run(device: &mut SimDevice, from: u32, to: u32) {
        for now in from..to {
            device.poll(now);
        }
    }

    #[test]
    fn test_boot_lines() {
        let mut device = Device::new(SimPins::default(), SimSensors::default(), 0);
        let out = drain(&mut device);
        assert_eq!(out, "R\nHW:uno-tb6612-v11 imu=0 batt=7800\n");
        assert!(device.init().is_running());
        assert!(device.outputs_locked());
    }

    #[test]
    fn test_hello_releases_lockout() {
        let (mut device, now) = booted();
        device.receive(b"{\"N\":0}\n");
        device.poll(now);
        assert_eq!(drain(&mut device), "{hello_ok}\n");
        assert!(!device.outputs_locked());
    }

    #[test]
    fn test_setpoint_drives_then_deadman() {
        let (mut device, mut now) = booted();
        device.receive(b"{\"N\":200,\"D1\":150,\"T\":200}\n");
        run(&mut device, now, now + 100);
        now += 100;
        assert_eq!(device.motion().owner(), MotionOwner::Setpoint);
        assert!(device.motion().outputs().left > 0);
        assert_eq!(drain(&mut device), "");

        run(&mut device, now, now + 200);
        assert_eq!(device.motion().owner(), MotionOwner::Stopped);
        assert!(device.motion().outputs().is_zero());
    }

    #[test]
    fn test_mixed_formats() {
        let (mut device, now) = booted();
        let frame = frame::encode(frame::TYPE_HELLO, 9, &[]).unwrap();
        device.receive(&frame);
        device.receive(b"{\"N\":201,\"H\":\"s\"}\n");
        run(&mut device, now, now + 50);

        let mut buf = [0u8; 64];
        let n = device.drain_output(&mut buf);
        let Decoded::Frame { frame, consumed } = decode_binary(&buf[..n]) else {
            panic!("expected ACK frame first");
        };
        assert_eq!(frame.msg_type, frame::TYPE_ACK);
        assert_eq!(frame.seq, 9);
        assert_eq!(&buf[consumed..n], b"{s_ok}\n");
    }

    #[test]
    fn test_corruption_is_counted() {
        let (mut device, now) = booted();
        let mut bad = frame::encode(frame::TYPE_E_STOP, 1, &[]).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        device.receive(&bad);
        device.receive(b"{\"N\":oops}\n");
        run(&mut device, now, now + 10);
        assert_eq!(device.counters().crc_failure_count(), 1);
        assert_eq!(device.counters().parse_error_count(), 1);
        assert_eq!(drain(&mut device), "");
    }

    #[test]
    fn test_rx_overflow() {
        let (mut device, _) = booted();
        let flood = [b' '; RX_QUEUE_CAPACITY + 8];
        assert_eq!(device.receive(&flood), RX_QUEUE_CAPACITY);
        assert_eq!(device.counters().rx_overflow_count(), 1);
    }

    #[test]
    fn test_rate_limit_drops_but_stop_passes() {
        let (mut device, now) = booted();
        // 60 commands inside 60ms, well within one window
        for i in 0..60 {
            device.receive(b"{\"N\":42}\n");
            device.poll(now + i);
        }
        assert_eq!(device.counters().rate_limited_count(), 10);
        drain(&mut device);
        device.receive(b"{\"N\":201,\"H\":\"k\"}\n");
        device.poll(now + 60);
        assert_eq!(drain(&mut device), "{k_ok}\n");
    }

    #[test]
    fn test_watchdog_restart() {
        let (mut device, now) = booted();
        device.receive(b"{\"N\":0}\n");
        device.poll(now);
        assert!(!device.outputs_locked());
        // A stalled loop: no pass for longer than the watchdog timeout
        device.poll(now + 5000);
        assert_eq!(device.reset_count(), 1);
        assert!(device.outputs_locked());
        let out = drain(&mut device);
        assert!(out.starts_with("R\nHW:"));
    }

    #[test]
    fn test_tx_overflow_drops_whole_reply() {
        let (mut device, mut now) = booted();
        // Diagnostics dumps are large; a few fill the queue
        for _ in 0..4 {
            device.receive(b"{\"N\":120,\"H\":\"d\"}\n");
            run(&mut device, now, now + 30);
            now += 30;
        }
        assert!(device.counters().tx_dropped_count() >= 1);
        let out = drain(&mut device);
        assert!(out.ends_with("}\n"));
    }

    #[test]
    fn test_binary_diagnostics_reply() {
        let (mut device, now) = booted();
        let frame = Frame::new(frame::TYPE_DIAGNOSTICS, 44, &[]).unwrap();
        device.receive(&frame.encode());
        run(&mut device, now, now + 5);
        let mut buf = [0u8; 128];
        let n = device.drain_output(&mut buf);
        match decode_binary(&buf[..n]) {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.msg_type, frame::TYPE_INFO);
                assert_eq!(frame.seq, 44);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
