// Battery-aware output shaping applied to every motor write
//
// Order per control tick: PWM cap, slew limit, kickstart, deadband lift.
// Kick and lift only push in the direction of the target.
// Stop paths call reset() so a zero command lands immediately.

use tracing::{debug, info};

use super::kinematics::WheelOutputs;

// Battery thresholds (mV)
pub const BATTERY_OK_MV: u16 = 7400;
pub const BATTERY_LOW_MV: u16 = 7000;

// Default deadband lift (PWM units)
pub const DEADBAND_DEFAULT: u8 = 55;

// Kickstart: boost above the deadband for a few ticks when a wheel starts
const KICK_BOOST: i16 = 25;
const KICK_TICKS: u8 = 4; // 80ms at 50Hz

// Override bounds
const STEP_OVERRIDE_MAX: i32 = 50;
const CAP_OVERRIDE_MIN: i32 = 50;
const CAP_OVERRIDE_MAX: i32 = 255;
const KICK_DEFAULT_SENTINEL: i32 = 0xFF;

// Selectors for the drive config command
pub const SELECT_DEADBAND: i32 = 1;
pub const SELECT_ACCEL: i32 = 2;
pub const SELECT_DECEL: i32 = 3;
pub const SELECT_KICK: i32 = 4;
pub const SELECT_MAX_PWM: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryClass {
    Ok = 0,
    Low = 1,
    Critical = 2,
}

impl BatteryClass {
    pub fn from_mv(mv: u16) -> Self {
        if mv >= BATTERY_OK_MV {
            Self::Ok
        } else if mv >= BATTERY_LOW_MV {
            Self::Low
        } else {
            Self::Critical
        }
    }

    fn max_pwm(self) -> u8 {
        match self {
            Self::Ok => 255,
            Self::Low => 180,
            Self::Critical => 100,
        }
    }

    fn accel_step(self) -> u8 {
        match self {
            Self::Ok => 12,
            Self::Low => 6,
            Self::Critical => 4,
        }
    }

    fn decel_step(self) -> u8 {
        match self {
            Self::Ok => 20,
            Self::Low => 15,
            Self::Critical => 10,
        }
    }
}

/// Error types for drive limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("Unknown drive config selector {0}")]
    UnknownSelector(i32),

    #[error("Value {value} out of range for selector {selector}")]
    OutOfRange { selector: i32, value: i32 },
}

/// Per-wheel limiter state. `current` is the slewed ramp before any
/// deadband or kick shaping, so the ramp can always pass through zero.
#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    current: i16,
    kick_ticks: u8,
}

impl Channel {
    fn apply(&mut self, target: i16, cfg: &Effective, deadband: u8) -> i16 {
        let capped = target.clamp(-i16::from(cfg.max_pwm), i16::from(cfg.max_pwm));
        let ramp = slew(self.current, capped, cfg.accel, cfg.decel);
        let toward_target = ramp != 0 && ramp.signum() == capped.signum();

        let out = if toward_target {
            let kicked = if cfg.kick {
                self.kickstart(ramp, deadband)
            } else {
                self.kick_ticks = 0;
                ramp
            };
            lift(kicked, deadband)
        } else {
            // Winding down or crossing zero: no lift, drop below the deadband
            self.kick_ticks = 0;
            if ramp.abs() < i16::from(deadband) { 0 } else { ramp }
        };
        self.current = ramp;
        out
    }

    fn kickstart(&mut self, value: i16, deadband: u8) -> i16 {
        let from_rest = self.current == 0 || self.current.signum() != value.signum();
        if self.kick_ticks == 0 && from_rest {
            self.kick_ticks = KICK_TICKS;
        }
        if self.kick_ticks == 0 {
            return value;
        }
        self.kick_ticks -= 1;
        let kick = i16::from(deadband) + KICK_BOOST;
        if value.abs() < kick {
            kick * value.signum()
        } else {
            value
        }
    }
}

fn slew(current: i16, target: i16, accel: u8, decel: u8) -> i16 {
    let diff = i32::from(target) - i32::from(current);
    if diff == 0 {
        return target;
    }
    let accelerating = if target == 0 {
        false
    } else if current == 0 {
        true
    } else if current.signum() == target.signum() {
        target.abs() > current.abs()
    } else {
        // Reversal ramps at the decel rate
        false
    };
    let step = i32::from(if accelerating { accel } else { decel });
    if diff.abs() <= step {
        target
    } else {
        (i32::from(current) + step * diff.signum()) as i16
    }
}

fn lift(value: i16, deadband: u8) -> i16 {
    let db = i16::from(deadband);
    if value != 0 && value.abs() < db {
        db * value.signum()
    } else {
        value
    }
}

struct Effective {
    max_pwm: u8,
    accel: u8,
    decel: u8,
    kick: bool,
}

/// Output shaping for both drive wheels.
#[derive(Debug, Clone)]
pub struct DriveLimiter {
    battery: BatteryClass,
    deadband: [u8; 2],
    left: Channel,
    right: Channel,
    accel_override: Option<u8>,
    decel_override: Option<u8>,
    max_pwm_override: Option<u8>,
    kick_override: Option<bool>,
}

impl Default for DriveLimiter {
    fn default() -> Self {
        Self {
            battery: BatteryClass::Ok,
            deadband: [DEADBAND_DEFAULT; 2],
            left: Channel::default(),
            right: Channel::default(),
            accel_override: None,
            decel_override: None,
            max_pwm_override: None,
            kick_override: None,
        }
    }
}

impl DriveLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclassify from the latest battery sample. A missing monitor leaves
    /// the class unchanged.
    pub fn update_battery(&mut self, mv: Option<u16>) {
        let Some(mv) = mv else { return };
        let class = BatteryClass::from_mv(mv);
        if class != self.battery {
            info!("Battery class {:?} -> {:?} ({} mV)", self.battery, class, mv);
            self.battery = class;
        }
    }

    /// Shape one tick worth of requested outputs.
    pub fn apply(&mut self, target: WheelOutputs) -> WheelOutputs {
        let cfg = self.effective();
        WheelOutputs {
            left: self.left.apply(target.left, &cfg, self.deadband[0]),
            right: self.right.apply(target.right, &cfg, self.deadband[1]),
        }
    }

    /// Forget slew and kick state; the next output starts from rest
    pub fn reset(&mut self) {
        self.left = Channel::default();
        self.right = Channel::default();
    }

    /// Apply a drive config `selector`/`value` pair.
    pub fn configure(&mut self, selector: i32, value: i32) -> Result<(), LimitError> {
        let out_of_range = LimitError::OutOfRange { selector, value };
        match selector {
            SELECT_DEADBAND => {
                if !(0..=0xFFFF).contains(&value) {
                    return Err(out_of_range);
                }
                let left = (value >> 8) as u8;
                let right = (value & 0xFF) as u8;
                self.deadband = [
                    if left == 0 { DEADBAND_DEFAULT } else { left },
                    if right == 0 { DEADBAND_DEFAULT } else { right },
                ];
            }
            SELECT_ACCEL => self.accel_override = step_override(value).ok_or(out_of_range)?,
            SELECT_DECEL => self.decel_override = step_override(value).ok_or(out_of_range)?,
            SELECT_KICK => {
                self.kick_override = match value {
                    0 => Some(false),
                    1 => Some(true),
                    _ => None,
                };
            }
            SELECT_MAX_PWM => {
                self.max_pwm_override = match value {
                    0 => None,
                    CAP_OVERRIDE_MIN..=CAP_OVERRIDE_MAX => Some(value as u8),
                    _ => return Err(out_of_range),
                };
            }
            other => return Err(LimitError::UnknownSelector(other)),
        }
        debug!("Drive config {} = {}", selector, value);
        Ok(())
    }

    fn effective(&self) -> Effective {
        Effective {
            max_pwm: self.max_pwm(),
            accel: self.accel_step(),
            decel: self.decel_step(),
            kick: self.kick_enabled(),
        }
    }

    pub fn battery(&self) -> BatteryClass {
        self.battery
    }

    pub fn max_pwm(&self) -> u8 {
        self.max_pwm_override.unwrap_or(self.battery.max_pwm())
    }

    pub fn accel_step(&self) -> u8 {
        self.accel_override.unwrap_or(self.battery.accel_step())
    }

    pub fn decel_step(&self) -> u8 {
        self.decel_override.unwrap_or(self.battery.decel_step())
    }

    /// Kickstart defaults to on only with a healthy battery
    pub fn kick_enabled(&self) -> bool {
        self.kick_override.unwrap_or(self.battery == BatteryClass::Ok)
    }

    pub fn deadband(&self) -> (u8, u8) {
        (self.deadband[0], self.deadband[1])
    }
}

/// 0 clears the override; 1..=50 sets it.
fn step_override(value: i32) -> Option<Option<u8>> {
    match value {
        0 => Some(None),
        1..=STEP_OVERRIDE_MAX => Some(Some(value as u8)),
        _ => None,
    }
}
