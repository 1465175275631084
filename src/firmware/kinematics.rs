// Differential-drive mixing for the two-wheel base
// Converts a forward velocity and yaw rate into left/right motor outputs.

use crate::config::OUTPUT_LIMIT;

/// Signed motor outputs for the two drive wheels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelOutputs {
    pub left: i16,
    pub right: i16,
}

impl WheelOutputs {
    pub fn new(left: i16, right: i16) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.left == 0 && self.right == 0
    }

    /// Both channels limited to the legal output range
    pub fn clamped(self) -> Self {
        Self {
            left: clamp_output(i32::from(self.left)),
            right: clamp_output(i32::from(self.right)),
        }
    }
}

fn clamp_output(value: i32) -> i16 {
    value.clamp(-i32::from(OUTPUT_LIMIT), i32::from(OUTPUT_LIMIT)) as i16
}

/// Mix velocity and yaw into wheel outputs
///
/// # Arguments
/// * `v` - Forward velocity (positive = forward)
/// * `w` - Yaw rate (positive = turn right: left wheel faster)
///
/// # Returns
/// `left = clamp(v + w)`, `right = clamp(v - w)`
pub fn mix(v: i32, w: i32) -> WheelOutputs {
    WheelOutputs {
        left: clamp_output(v.saturating_add(w)),
        right: clamp_output(v.saturating_sub(w)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_motion() {
        let wheels = mix(200, 0);
        assert_eq!(wheels, WheelOutputs::new(200, 200));
    }

    #[test]
    fn test_pure_rotation() {
        let wheels = mix(0, 200);
        assert_eq!(wheels, WheelOutputs::new(200, -200));
    }

    #[test]
    fn test_combined_is_clamped() {
        let wheels = mix(200, 100);
        assert_eq!(wheels.left, 255);
        assert_eq!(wheels.right, 100);

        let wheels = mix(-255, 255);
        assert_eq!(wheels, WheelOutputs::new(0, -255));
    }

    #[test]
    fn test_extreme_inputs_do_not_overflow() {
        let wheels = mix(i32::MAX, i32::MAX);
        assert_eq!(wheels.left, OUTPUT_LIMIT);
        assert_eq!(wheels.right, 0);
        let wheels = mix(i32::MIN, 1);
        assert_eq!(wheels, WheelOutputs::new(-OUTPUT_LIMIT, -OUTPUT_LIMIT));
    }

    #[test]
    fn test_zero() {
        assert!(mix(0, 0).is_zero());
        assert!(WheelOutputs::zero().is_zero());
    }
}
