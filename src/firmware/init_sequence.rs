// Startup init sequence
//
// Non-blocking, tick-driven bring-up of the non-motor hardware: cycle the
// driver standby pin, center the pan servo, then smoke-check the sensors.
// Runs at boot and again on request. Motion commands are refused while it
// runs.

use tracing::{info, warn};

use super::drive_limits::BatteryClass;
use super::hal::PinBank;
use super::motion::MotionController;
use super::sensors::SensorCache;
use crate::config::SERVO_CENTER_ANGLE;

// Step durations (ms)
const STEP_STANDBY_MS: u32 = 20;
const STEP_SERVO_MS: u32 = 350;
const STEP_SENSOR_MS: u32 = 100;

// Warning bits
pub const WARN_BATT_LOW: u8 = 0x01;
pub const WARN_BATT_CRIT: u8 = 0x02;
pub const WARN_IMU_MISSING: u8 = 0x04;
pub const WARN_ULTRA_MISSING: u8 = 0x10;
pub const WARN_SERVO_SKIP: u8 = 0x20;

/// Overall state, reported in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Pending = 0,
    Running = 1,
    Done = 2,
    Warn = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Standby,
    ServoCenter,
    SensorCheck,
}

#[derive(Debug, Clone)]
pub struct InitSequence {
    state: InitState,
    step: Step,
    step_started_ms: u32,
    warn_bits: u8,
}

impl Default for InitSequence {
    fn default() -> Self {
        Self {
            state: InitState::Pending,
            step: Step::Idle,
            step_started_ms: 0,
            warn_bits: 0,
        }
    }
}

impl InitSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or restart) the sequence. Battery warnings are taken from the
    /// cache up front so a critical pack can skip the servo step.
    pub fn start(&mut self, now_ms: u32, sensors: &SensorCache) {
        self.warn_bits = match sensors.battery_mv().map(BatteryClass::from_mv) {
            Some(BatteryClass::Low) => WARN_BATT_LOW,
            Some(BatteryClass::Critical) => WARN_BATT_CRIT,
            _ => 0,
        };
        self.state = InitState::Running;
        self.step = Step::Standby;
        self.step_started_ms = now_ms;
        info!("Init sequence started");
    }

    /// Stop mid-way and fall back to pending.
    pub fn abort(&mut self) {
        if self.step != Step::Idle {
            warn!("Init sequence aborted");
            self.step = Step::Idle;
            self.state = InitState::Pending;
        }
    }

    /// Advance one control tick.
    pub fn tick<P: PinBank>(
        &mut self,
        now_ms: u32,
        motion: &mut MotionController<P>,
        sensors: &SensorCache,
    ) {
        let elapsed = now_ms.wrapping_sub(self.step_started_ms);
        match self.step {
            Step::Idle => {}
            Step::Standby => {
                if elapsed < STEP_STANDBY_MS {
                    motion.pulse_standby(false);
                } else {
                    motion.pulse_standby(true);
                    self.enter(Step::ServoCenter, now_ms);
                    if self.warn_bits & WARN_BATT_CRIT == 0 {
                        motion.set_servo(SERVO_CENTER_ANGLE);
                    } else {
                        self.warn_bits |= WARN_SERVO_SKIP;
                    }
                }
            }
            Step::ServoCenter => {
                if elapsed >= STEP_SERVO_MS {
                    self.enter(Step::SensorCheck, now_ms);
                }
            }
            Step::SensorCheck => {
                if elapsed >= STEP_SENSOR_MS {
                    if sensors.distance_cm() == 0 {
                        self.warn_bits |= WARN_ULTRA_MISSING;
                    }
                    if !sensors.imu_present() {
                        self.warn_bits |= WARN_IMU_MISSING;
                    }
                    // Leave the driver in standby until a motion owner wants it
                    motion.pulse_standby(false);
                    self.finish();
                }
            }
        }
    }

    fn enter(&mut self, step: Step, now_ms: u32) {
        self.step = step;
        self.step_started_ms = now_ms;
    }

    fn finish(&mut self) {
        self.step = Step::Idle;
        self.state = if self.warn_bits == 0 {
            InitState::Done
        } else {
            InitState::Warn
        };
        info!(
            "Init sequence finished: {:?} (warn 0x{:02X})",
            self.state, self.warn_bits
        );
    }

    pub fn is_running(&self) -> bool {
        self.step != Step::Idle
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn warn_bits(&self) -> u8 {
        self.warn_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::hal::{Actuators, SimPins};
    use crate::firmware::sensors::SimSensors;

    fn run(init: &mut InitSequence, motion: &mut MotionController<SimPins>, cache: &SensorCache) {
        let mut now = 0;
        init.start(now, cache);
        while init.is_running() && now < 2000 {
            init.tick(now, motion, cache);
            now += 20;
        }
    }

    #[test]
    fn test_healthy_run_completes() {
        let mut sim = SimSensors {
            imu: true,
            ..SimSensors::default()
        };
        let mut cache = SensorCache::new();
        cache.poll(&mut sim, 0);
        let mut motion = MotionController::new(Actuators::new(SimPins::default()));
        let mut init = InitSequence::new();
        assert_eq!(init.state(), InitState::Pending);
        run(&mut init, &mut motion, &cache);
        assert_eq!(init.state(), InitState::Done);
        assert_eq!(init.warn_bits(), 0);
        assert_eq!(motion.actuators().pins().servo, Some(SERVO_CENTER_ANGLE));
        assert!(!motion.driver_enabled());
    }

    #[test]
    fn test_missing_sensors_warn() {
        let mut sim = SimSensors {
            distance_cm: None,
            battery_mv: Some(6500),
            ..SimSensors::default()
        };
        let mut cache = SensorCache::new();
        cache.poll(&mut sim, 0);
        let mut motion = MotionController::new(Actuators::new(SimPins::default()));
        let mut init = InitSequence::new();
        run(&mut init, &mut motion, &cache);
        assert_eq!(init.state(), InitState::Warn);
        let bits = init.warn_bits();
        assert_ne!(bits & WARN_BATT_CRIT, 0);
        assert_ne!(bits & WARN_SERVO_SKIP, 0);
        assert_ne!(bits & WARN_ULTRA_MISSING, 0);
        assert_ne!(bits & WARN_IMU_MISSING, 0);
        assert_eq!(motion.actuators().pins().servo, None);
    }

    #[test]
    fn test_abort() {
        let cache = SensorCache::new();
        let mut motion = MotionController::new(Actuators::new(SimPins::default()));
        let mut init = InitSequence::new();
        init.start(0, &cache);
        init.tick(0, &mut motion, &cache);
        assert!(init.is_running());
        init.abort();
        assert!(!init.is_running());
        assert_eq!(init.state(), InitState::Pending);
    }
}
