// Command router: one handler per command, at most one reply per command
//
// Setpoints never get a reply. Every other command gets exactly one, in the
// encoding it arrived with. Unknown numbers are acknowledged without side
// effects.

use tracing::{debug, warn};

use super::diagnostics::{DiagnosticCounters, Snapshot};
use super::hal::PinBank;
use super::init_sequence::InitSequence;
use super::motion::MotionController;
use super::sensors::{LineChannel, SensorCache};
use crate::config::{OBSTACLE_THRESHOLD_CM, SERVO_MAX_ANGLE, SERVO_MIN_ANGLE};
use crate::protocol::command::{
    Command, CommandKind, ReplyBytes, ReplyTo, Status, binary_reply, encode_response,
};
use crate::protocol::frame::TYPE_INFO;
use crate::protocol::text::Tag;

/// Tag used for untagged hello replies: `{hello_ok}`
const HELLO_TAG: &str = "hello";

/// Borrowed view of the device state a handler may touch.
pub struct RouterContext<'a, P: PinBank> {
    pub motion: &'a mut MotionController<P>,
    pub sensors: &'a SensorCache,
    pub init: &'a mut InitSequence,
    pub counters: &'a mut DiagnosticCounters,
    pub reset_count: u16,
    pub now_ms: u32,
}

enum Outcome {
    Reply(Status),
    Value(i32),
    Raw(ReplyBytes),
    Silent,
}

/// Route a command to its handler and build the reply, if any.
pub fn dispatch<P: PinBank>(cmd: &Command, ctx: RouterContext<'_, P>) -> Option<ReplyBytes> {
    let kind = cmd.kind();

    // An oversize tag is a protocol violation; only hard stops still act
    if cmd.tag_truncated && !matches!(kind, CommandKind::Stop | CommandKind::LegacyStop) {
        ctx.counters.rejected();
        warn!("Command {} rejected: tag too long", cmd.number);
        return kind
            .expects_reply()
            .then(|| encode_response(&cmd.reply_to, Status::False, None));
    }

    let outcome = handle(cmd, kind, ctx);
    match outcome {
        Outcome::Reply(status) => Some(encode_response(&cmd.reply_to, status, None)),
        Outcome::Value(v) => Some(encode_response(&cmd.reply_to, Status::Ok, Some(v))),
        Outcome::Raw(bytes) => Some(bytes),
        Outcome::Silent => None,
    }
}

fn handle<P: PinBank>(cmd: &Command, kind: CommandKind, ctx: RouterContext<'_, P>) -> Outcome {
    let [d1, d2, _, _] = cmd.data;
    let RouterContext {
        motion,
        sensors,
        init,
        counters,
        reset_count,
        now_ms,
    } = ctx;

    // Motion is refused while the init sequence owns the hardware
    if kind.is_motion() && init.is_running() {
        counters.rejected();
        debug!("Motion command {} refused during init", cmd.number);
        return if kind.expects_reply() {
            Outcome::Reply(Status::False)
        } else {
            Outcome::Silent
        };
    }

    match kind {
        CommandKind::Hello => Outcome::Raw(hello_reply(&cmd.reply_to)),
        CommandKind::Servo => {
            if (i32::from(SERVO_MIN_ANGLE)..=i32::from(SERVO_MAX_ANGLE)).contains(&d1) {
                motion.set_servo(d1 as u8);
                Outcome::Reply(Status::Ok)
            } else {
                counters.rejected();
                Outcome::Reply(Status::False)
            }
        }
        CommandKind::Ultrasonic => match d1 {
            1 if sensors.obstacle_within(OBSTACLE_THRESHOLD_CM) => Outcome::Reply(Status::True),
            1 => Outcome::Reply(Status::False),
            2 => Outcome::Value(i32::from(sensors.distance_cm())),
            _ => Outcome::Reply(Status::Ok),
        },
        CommandKind::LineSensor => match LineChannel::from_selector(d1) {
            Some(channel) => Outcome::Value(i32::from(sensors.line(channel))),
            None => {
                counters.rejected();
                Outcome::Reply(Status::False)
            }
        },
        CommandKind::Battery => match sensors.battery_mv() {
            Some(mv) => Outcome::Value(i32::from(mv)),
            None => Outcome::Reply(Status::False),
        },
        CommandKind::LegacyStop => {
            init.abort();
            motion.standby();
            Outcome::Reply(Status::Ok)
        }
        CommandKind::Diagnostics => {
            let snapshot = snapshot(motion, sensors, init, *counters, reset_count, now_ms);
            Outcome::Raw(match &cmd.reply_to {
                ReplyTo::Text(tag) => snapshot.to_text(tag),
                ReplyTo::Binary { seq, .. } => binary_reply(TYPE_INFO, *seq, &snapshot.to_payload()),
            })
        }
        CommandKind::InitRerun => {
            init.abort();
            motion.standby();
            init.start(now_ms, sensors);
            Outcome::Reply(Status::Ok)
        }
        CommandKind::DriveConfig => match motion.limiter_mut().configure(d1, d2) {
            Ok(()) => Outcome::Reply(Status::Ok),
            Err(e) => {
                counters.rejected();
                debug!("{}", e);
                Outcome::Reply(Status::False)
            }
        },
        CommandKind::Setpoint => {
            if let Err(e) = motion.set_setpoint(d1, d2, cmd.ttl_ms, now_ms) {
                counters.rejected();
                debug!("Setpoint dropped: {}", e);
            }
            Outcome::Silent
        }
        CommandKind::Stop => {
            init.abort();
            motion.stop();
            Outcome::Reply(Status::Ok)
        }
        CommandKind::MacroStart => match motion.start_macro(d1, d2, cmd.ttl_ms, now_ms) {
            Ok(_) => Outcome::Reply(Status::Ok),
            Err(e) => {
                counters.rejected();
                debug!("Macro start refused: {}", e);
                Outcome::Reply(Status::False)
            }
        },
        CommandKind::MacroCancel => {
            motion.cancel_macro();
            Outcome::Reply(Status::Ok)
        }
        CommandKind::Direct => match motion.set_direct(d1, d2) {
            Ok(()) => Outcome::Reply(Status::Ok),
            Err(e) => {
                counters.rejected();
                debug!("Direct output refused: {}", e);
                Outcome::Reply(Status::False)
            }
        },
        CommandKind::Other(n) => {
            debug!("Generic acknowledge for command {}", n);
            Outcome::Reply(Status::Ok)
        }
    }
}

fn hello_reply(reply_to: &ReplyTo) -> ReplyBytes {
    match reply_to {
        ReplyTo::Text(tag) if tag.is_empty() => {
            let mut hello = Tag::new();
            let _ = hello.push_str(HELLO_TAG);
            encode_response(&ReplyTo::Text(hello), Status::Ok, None)
        }
        other => encode_response(other, Status::Ok, None),
    }
}

/// Capture the current state for the diagnostics command.
pub fn snapshot<P: PinBank>(
    motion: &MotionController<P>,
    sensors: &SensorCache,
    init: &InitSequence,
    counters: DiagnosticCounters,
    reset_count: u16,
    now_ms: u32,
) -> Snapshot {
    let outputs = motion.outputs();
    let limiter = motion.limiter();
    Snapshot {
        owner: motion.owner(),
        left: outputs.left,
        right: outputs.right,
        driver_enabled: motion.driver_enabled(),
        macro_step: motion
            .macros()
            .state()
            .map(|s| (s.id as u8, s.step_index as u8)),
        reset_count,
        imu: sensors.imu_present(),
        battery_mv: sensors.battery_mv(),
        battery: limiter.battery(),
        max_pwm: limiter.max_pwm(),
        deadband: limiter.deadband(),
        ramp: (limiter.accel_step(), limiter.decel_step()),
        kick: limiter.kick_enabled(),
        init: init.state(),
        init_warn: init.warn_bits(),
        counters,
        now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::hal::{Actuators, SimPins};
    use crate::firmware::motion::MotionOwner;
    use crate::firmware::sensors::SimSensors;
    use crate::protocol::command::Inbound;
    use crate::protocol::frame::{self, Decoded, Frame, decode_binary};
    use crate::protocol::text::decode_text;

    struct Rig {
        motion: MotionController<SimPins>,
        sensors: SensorCache,
        init: InitSequence,
        counters: DiagnosticCounters,
    }

    impl Rig {
        fn new() -> Self {
            let mut sensors = SensorCache::new();
            sensors.poll(&mut SimSensors::default(), 0);
            Self {
                motion: MotionController::new(Actuators::new(SimPins::default())),
                sensors,
                init: InitSequence::new(),
                counters: DiagnosticCounters::default(),
            }
        }

        fn send(&mut self, line: &str) -> Option<String> {
            let cmd = Command::from(decode_text(line.as_bytes()).unwrap());
            self.dispatch(&cmd)
                .map(|b| std::string::String::from_utf8(b.to_vec()).unwrap())
        }

        fn dispatch(&mut self, cmd: &Command) -> Option<ReplyBytes> {
            dispatch(
                cmd,
                RouterContext {
                    motion: &mut self.motion,
                    sensors: &self.sensors,
                    init: &mut self.init,
                    counters: &mut self.counters,
                    reset_count: 1,
                    now_ms: 100,
                },
            )
        }
    }

    #[test]
    fn test_hello() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":0}"#).unwrap(), "{hello_ok}\n");
        assert_eq!(rig.send(r#"{"N":0,"H":"b1"}"#).unwrap(), "{b1_ok}\n");
    }

    #[test]
    fn test_setpoint_is_silent() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":200,"H":"x","D1":100,"T":300}"#), None);
        assert_eq!(rig.motion.owner(), MotionOwner::Setpoint);
        // Rejected setpoints are silent too
        assert_eq!(rig.send(r#"{"N":200,"D1":999}"#), None);
        assert_eq!(rig.counters.rejected_count(), 1);
    }

    #[test]
    fn test_stop_always_ok() {
        let mut rig = Rig::new();
        rig.send(r#"{"N":999,"D1":100,"D2":100}"#);
        assert_eq!(rig.send(r#"{"N":201,"H":"s"}"#).unwrap(), "{s_ok}\n");
        assert_eq!(rig.motion.owner(), MotionOwner::Stopped);
        assert_eq!(rig.send(r#"{"N":201,"H":"s"}"#).unwrap(), "{s_ok}\n");
    }

    #[test]
    fn test_legacy_stop_goes_idle() {
        let mut rig = Rig::new();
        rig.send(r#"{"N":999,"D1":100,"D2":100}"#);
        assert_eq!(rig.send(r#"{"N":110,"H":"l"}"#).unwrap(), "{l_ok}\n");
        assert_eq!(rig.motion.owner(), MotionOwner::Idle);
    }

    #[test]
    fn test_servo_range() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":5,"H":"a","D1":180}"#).unwrap(), "{a_ok}\n");
        assert_eq!(rig.motion.servo_angle(), 180);
        assert_eq!(rig.send(r#"{"N":5,"H":"a","D1":181}"#).unwrap(), "{a_false}\n");
        assert_eq!(rig.motion.servo_angle(), 180);
    }

    #[test]
    fn test_sensor_queries() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":21,"H":"u","D1":2}"#).unwrap(), "{u_120}\n");
        assert_eq!(rig.send(r#"{"N":21,"H":"u","D1":1}"#).unwrap(), "{u_false}\n");
        assert_eq!(rig.send(r#"{"N":21,"H":"u"}"#).unwrap(), "{u_ok}\n");
        assert_eq!(rig.send(r#"{"N":22,"H":"l","D1":1}"#).unwrap(), "{l_650}\n");
        assert_eq!(rig.send(r#"{"N":22,"H":"l","D1":5}"#).unwrap(), "{l_false}\n");
        assert_eq!(rig.send(r#"{"N":23,"H":"b"}"#).unwrap(), "{b_7800}\n");
    }

    #[test]
    fn test_obstacle_true() {
        let mut rig = Rig::new();
        let mut near = SimSensors {
            distance_cm: Some(12),
            ..SimSensors::default()
        };
        rig.sensors.poll(&mut near, 50);
        assert_eq!(rig.send(r#"{"N":21,"H":"u","D1":1}"#).unwrap(), "{u_true}\n");
    }

    #[test]
    fn test_macro_replies() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":210,"H":"m","D1":2,"T":5000}"#).unwrap(), "{m_ok}\n");
        assert_eq!(rig.motion.owner(), MotionOwner::Macro);
        assert_eq!(rig.send(r#"{"N":210,"H":"m","D1":7}"#).unwrap(), "{m_false}\n");
        assert_eq!(rig.send(r#"{"N":211,"H":"c"}"#).unwrap(), "{c_ok}\n");
        assert_eq!(rig.send(r#"{"N":211,"H":"c"}"#).unwrap(), "{c_ok}\n");
    }

    #[test]
    fn test_unknown_command_is_acknowledged() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":42,"H":"q"}"#).unwrap(), "{q_ok}\n");
        assert_eq!(rig.motion.owner(), MotionOwner::Idle);
    }

    #[test]
    fn test_drive_config() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":140,"H":"c","D1":5,"D2":120}"#).unwrap(), "{c_ok}\n");
        assert_eq!(rig.motion.limiter().max_pwm(), 120);
        assert_eq!(rig.send(r#"{"N":140,"H":"c","D1":5,"D2":10}"#).unwrap(), "{c_false}\n");
    }

    #[test]
    fn test_oversize_tag_fails_closed() {
        let mut rig = Rig::new();
        let reply = rig.send(r#"{"N":999,"H":"abcdefghijklmn","D1":50,"D2":50}"#).unwrap();
        assert_eq!(reply, "{abcdefghijk_false}\n");
        assert_eq!(rig.motion.owner(), MotionOwner::Idle);
        // Hard stop still acts
        rig.send(r#"{"N":999,"D1":50,"D2":50}"#);
        rig.send(r#"{"N":201,"H":"abcdefghijklmn"}"#);
        assert_eq!(rig.motion.owner(), MotionOwner::Stopped);
    }

    #[test]
    fn test_motion_refused_during_init() {
        let mut rig = Rig::new();
        assert_eq!(rig.send(r#"{"N":130,"H":"i"}"#).unwrap(), "{i_ok}\n");
        assert!(rig.init.is_running());
        assert_eq!(rig.send(r#"{"N":999,"H":"d","D1":50}"#).unwrap(), "{d_false}\n");
        assert_eq!(rig.send(r#"{"N":200,"D1":50}"#), None);
        assert_eq!(rig.motion.owner(), MotionOwner::Idle);
        // Stop is never refused and aborts the sequence
        rig.send(r#"{"N":201}"#);
        assert!(!rig.init.is_running());
    }

    #[test]
    fn test_text_diagnostics() {
        let mut rig = Rig::new();
        let dump = rig.send(r#"{"N":120,"H":"d"}"#).unwrap();
        assert!(dump.starts_with("{d_diag:owner=I,"));
        assert!(dump.contains("\n{d_stats:"));
    }

    #[test]
    fn test_binary_replies() {
        let mut rig = Rig::new();
        let frame = Frame::new(frame::TYPE_DIAGNOSTICS, 12, &[]).unwrap();
        let cmd = Command::try_from(Inbound::Frame(frame)).unwrap();
        let bytes = rig.dispatch(&cmd).unwrap();
        match decode_binary(&bytes) {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.msg_type, TYPE_INFO);
                assert_eq!(frame.seq, 12);
                assert_eq!(frame.payload[0], b'I');
            }
            other => panic!("unexpected {:?}", other),
        }

        let frame = Frame::new(frame::TYPE_DRIVE_TWIST, 13, &[100, 0, 0, 0]).unwrap();
        let cmd = Command::try_from(frame).unwrap();
        assert!(rig.dispatch(&cmd).is_none());
        assert_eq!(rig.motion.owner(), MotionOwner::Setpoint);
    }
}
