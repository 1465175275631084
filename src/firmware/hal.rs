// Motor and servo hardware abstraction
//
// TB6612 dual H-bridge: one PWM pin and one direction pin per motor, plus a
// shared standby pin that must be high for any output to reach the motors.
// The pan servo takes an angle in degrees.

use tracing::debug;

use super::kinematics::WheelOutputs;
use crate::config::{OUTPUT_LIMIT, SERVO_CENTER_ANGLE};

/// Pin assignments for the shield
pub const PIN_MOTOR_PWMA: u8 = 5; // right motor PWM
pub const PIN_MOTOR_PWMB: u8 = 6; // left motor PWM
pub const PIN_MOTOR_AIN1: u8 = 7; // right motor direction
pub const PIN_MOTOR_BIN1: u8 = 8; // left motor direction
pub const PIN_MOTOR_STBY: u8 = 3;
pub const PIN_SERVO_PAN: u8 = 10;

/// Raw pin access. Implemented by the board support layer on hardware and by
/// [`SimPins`] everywhere else.
pub trait PinBank {
    fn digital_write(&mut self, pin: u8, high: bool);
    fn analog_write(&mut self, pin: u8, duty: u8);
    fn servo_write(&mut self, pin: u8, angle: u8);
}

/// Motor driver and pan servo on one pin bank.
///
/// This is the only type that writes actuator pins; the motion controller
/// decides what to write.
pub struct Actuators<P: PinBank> {
    pins: P,
    enabled: bool,
    outputs: WheelOutputs,
    servo_angle: u8,
}

impl<P: PinBank> Actuators<P> {
    /// Take ownership of the pins and put them in the safe power-on state:
    /// standby low, zero duty, forward direction.
    pub fn new(mut pins: P) -> Self {
        pins.digital_write(PIN_MOTOR_STBY, false);
        pins.analog_write(PIN_MOTOR_PWMA, 0);
        pins.analog_write(PIN_MOTOR_PWMB, 0);
        pins.digital_write(PIN_MOTOR_AIN1, true);
        pins.digital_write(PIN_MOTOR_BIN1, true);
        Self {
            pins,
            enabled: false,
            outputs: WheelOutputs::zero(),
            servo_angle: SERVO_CENTER_ANGLE,
        }
    }

    /// Raise standby so duty reaches the motors
    pub fn enable(&mut self) {
        if !self.enabled {
            debug!("Motor driver enabled");
        }
        self.pins.digital_write(PIN_MOTOR_STBY, true);
        self.enabled = true;
    }

    /// Zero both motors and drop the driver into standby
    pub fn standby(&mut self) {
        self.pins.analog_write(PIN_MOTOR_PWMA, 0);
        self.pins.analog_write(PIN_MOTOR_PWMB, 0);
        self.pins.digital_write(PIN_MOTOR_STBY, false);
        self.enabled = false;
        self.outputs = WheelOutputs::zero();
    }

    /// Write signed outputs to both motors.
    pub fn write_motors(&mut self, outputs: WheelOutputs) {
        let outputs = outputs.clamped();
        write_channel(&mut self.pins, PIN_MOTOR_AIN1, PIN_MOTOR_PWMA, outputs.right);
        write_channel(&mut self.pins, PIN_MOTOR_BIN1, PIN_MOTOR_PWMB, outputs.left);
        self.outputs = outputs;
    }

    pub fn set_servo(&mut self, angle: u8) {
        self.pins.servo_write(PIN_SERVO_PAN, angle);
        self.servo_angle = angle;
    }

    pub fn outputs(&self) -> WheelOutputs {
        self.outputs
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn servo_angle(&self) -> u8 {
        self.servo_angle
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }
}

impl<P: PinBank> Drop for Actuators<P> {
    fn drop(&mut self) {
        self.standby();
    }
}

fn write_channel<P: PinBank>(pins: &mut P, dir_pin: u8, pwm_pin: u8, value: i16) {
    let value = value.clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT);
    if value > 0 {
        pins.digital_write(dir_pin, true);
    } else if value < 0 {
        pins.digital_write(dir_pin, false);
    }
    pins.analog_write(pwm_pin, value.unsigned_abs() as u8);
}

/// In-memory pin bank for simulation and tests.
#[derive(Debug, Clone)]
pub struct SimPins {
    pub digital: [bool; 16],
    pub analog: [u8; 16],
    pub servo: Option<u8>,
    pub writes: u32,
}

impl Default for SimPins {
    fn default() -> Self {
        Self {
            digital: [false; 16],
            analog: [0; 16],
            servo: None,
            writes: 0,
        }
    }
}

impl SimPins {
    /// Signed output currently seen by a motor, as the H-bridge would apply
    /// it: zero whenever standby is low.
    pub fn motor_output(&self, dir_pin: u8, pwm_pin: u8) -> i16 {
        if !self.digital[PIN_MOTOR_STBY as usize] {
            return 0;
        }
        let duty = i16::from(self.analog[pwm_pin as usize]);
        if self.digital[dir_pin as usize] { duty } else { -duty }
    }

    pub fn left(&self) -> i16 {
        self.motor_output(PIN_MOTOR_BIN1, PIN_MOTOR_PWMB)
    }

    pub fn right(&self) -> i16 {
        self.motor_output(PIN_MOTOR_AIN1, PIN_MOTOR_PWMA)
    }
}

impl PinBank for SimPins {
    fn digital_write(&mut self, pin: u8, high: bool) {
        if let Some(slot) = self.digital.get_mut(pin as usize) {
            *slot = high;
        }
        self.writes += 1;
    }

    fn analog_write(&mut self, pin: u8, duty: u8) {
        if let Some(slot) = self.analog.get_mut(pin as usize) {
            *slot = duty;
        }
        self.writes += 1;
    }

    fn servo_write(&mut self, _pin: u8, angle: u8) {
        self.servo = Some(angle);
        self.writes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_is_safe() {
        let hw = Actuators::new(SimPins::default());
        assert!(!hw.is_enabled());
        assert_eq!(hw.pins().left(), 0);
        assert_eq!(hw.pins().right(), 0);
    }

    #[test]
    fn test_direction_logic() {
        let mut hw = Actuators::new(SimPins::default());
        hw.enable();
        hw.write_motors(WheelOutputs::new(120, -80));
        assert_eq!(hw.pins().left(), 120);
        assert_eq!(hw.pins().right(), -80);
        assert!(hw.pins().digital[PIN_MOTOR_BIN1 as usize]);
        assert!(!hw.pins().digital[PIN_MOTOR_AIN1 as usize]);
    }

    #[test]
    fn test_outputs_need_standby_high() {
        let mut hw = Actuators::new(SimPins::default());
        hw.write_motors(WheelOutputs::new(200, 200));
        // Duty is latched but the bridge is in standby
        assert_eq!(hw.pins().left(), 0);
        hw.enable();
        assert_eq!(hw.pins().left(), 200);
    }

    #[test]
    fn test_standby_zeroes_everything() {
        let mut hw = Actuators::new(SimPins::default());
        hw.enable();
        hw.write_motors(WheelOutputs::new(-255, 255));
        hw.standby();
        assert!(!hw.is_enabled());
        assert_eq!(hw.outputs(), WheelOutputs::zero());
        assert_eq!(hw.pins().analog[PIN_MOTOR_PWMA as usize], 0);
        assert_eq!(hw.pins().analog[PIN_MOTOR_PWMB as usize], 0);
    }

    #[test]
    fn test_servo_write() {
        let mut hw = Actuators::new(SimPins::default());
        assert_eq!(hw.servo_angle(), SERVO_CENTER_ANGLE);
        hw.set_servo(45);
        assert_eq!(hw.pins().servo, Some(45));
        assert_eq!(hw.servo_angle(), 45);
    }
}
