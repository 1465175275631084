// Motion controller: the single authority over motor output
//
// Exactly one owner (direct, setpoint or macro) may drive the motors at a
// time. Handing over to a different owner first writes zero to the motors
// and clears the limiter so two sources never interleave writes. Setpoints
// carry a TTL and are cut by the deadman check on every control tick.

use tracing::{debug, info};

use super::drive_limits::DriveLimiter;
use super::hal::{Actuators, PinBank};
use super::kinematics::{WheelOutputs, mix};
use super::macros::{MacroEngine, MacroError, MacroId, MacroTick};
use crate::config::{OUTPUT_LIMIT, SETPOINT_TTL_DEFAULT_MS, SETPOINT_TTL_MAX_MS, SETPOINT_TTL_MIN_MS};

/// Who may write the motors right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOwner {
    Idle,
    Direct,
    Setpoint,
    Macro,
    Stopped,
}

impl MotionOwner {
    /// Single-letter code used in diagnostics dumps
    pub fn code(self) -> char {
        match self {
            Self::Idle => 'I',
            Self::Direct => 'D',
            Self::Setpoint => 'S',
            Self::Macro => 'M',
            Self::Stopped => 'X',
        }
    }
}

/// Error types for rejected motion requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MotionError {
    #[error("Value {0} outside -255..=255")]
    OutOfRange(i32),

    #[error("Setpoint TTL {0}ms outside {min}..={max}", min = SETPOINT_TTL_MIN_MS, max = SETPOINT_TTL_MAX_MS)]
    TtlOutOfRange(u32),

    #[error(transparent)]
    Macro(#[from] MacroError),
}

/// A streaming velocity/yaw command with its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetpointCommand {
    pub v: i16,
    pub w: i16,
    pub ttl_ms: u32,
    pub received_at_ms: u32,
}

impl SetpointCommand {
    pub fn is_expired(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.received_at_ms) >= self.ttl_ms
    }
}

/// What a control tick did, for the caller's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Running,
    SetpointExpired,
    MacroCompleted,
    MacroExpired,
}

pub struct MotionController<P: PinBank> {
    hw: Actuators<P>,
    limiter: DriveLimiter,
    macros: MacroEngine,
    owner: MotionOwner,
    setpoint: Option<SetpointCommand>,
    direct: WheelOutputs,
    commanded: WheelOutputs,
}

fn check_range(value: i32) -> Result<i16, MotionError> {
    let limit = i32::from(OUTPUT_LIMIT);
    if (-limit..=limit).contains(&value) {
        Ok(value as i16)
    } else {
        Err(MotionError::OutOfRange(value))
    }
}

impl<P: PinBank> MotionController<P> {
    pub fn new(hw: Actuators<P>) -> Self {
        Self {
            hw,
            limiter: DriveLimiter::new(),
            macros: MacroEngine::new(),
            owner: MotionOwner::Idle,
            setpoint: None,
            direct: WheelOutputs::zero(),
            commanded: WheelOutputs::zero(),
        }
    }

    /// Write zero and forget every owner's targets before a handover.
    fn neutralize(&mut self) {
        self.hw.write_motors(WheelOutputs::zero());
        self.limiter.reset();
        self.setpoint = None;
        self.direct = WheelOutputs::zero();
        self.commanded = WheelOutputs::zero();
        self.macros.cancel();
    }

    fn take_ownership(&mut self, owner: MotionOwner) {
        if self.owner != owner {
            self.neutralize();
            debug!("Motion owner {:?} -> {:?}", self.owner, owner);
            self.owner = owner;
        }
        self.hw.enable();
    }

    /// Accept or refresh a streaming setpoint. A missing TTL gets the default.
    pub fn set_setpoint(
        &mut self,
        v: i32,
        w: i32,
        ttl_ms: Option<u32>,
        now_ms: u32,
    ) -> Result<(), MotionError> {
        let v = check_range(v)?;
        let w = check_range(w)?;
        let ttl_ms = ttl_ms.unwrap_or(SETPOINT_TTL_DEFAULT_MS);
        if !(SETPOINT_TTL_MIN_MS..=SETPOINT_TTL_MAX_MS).contains(&ttl_ms) {
            return Err(MotionError::TtlOutOfRange(ttl_ms));
        }
        self.take_ownership(MotionOwner::Setpoint);
        // Refresh replaces the deadline, it never extends the old one
        self.setpoint = Some(SetpointCommand {
            v,
            w,
            ttl_ms,
            received_at_ms: now_ms,
        });
        Ok(())
    }

    /// Hold raw left/right outputs until preempted or stopped. No TTL.
    pub fn set_direct(&mut self, left: i32, right: i32) -> Result<(), MotionError> {
        let outputs = WheelOutputs::new(check_range(left)?, check_range(right)?);
        self.take_ownership(MotionOwner::Direct);
        self.direct = outputs;
        Ok(())
    }

    /// Start a macro; the controller becomes its owner.
    pub fn start_macro(
        &mut self,
        id: i32,
        intensity: i32,
        ttl_ms: Option<u32>,
        now_ms: u32,
    ) -> Result<MacroId, MotionError> {
        if self.owner == MotionOwner::Macro {
            // Replacement keeps ownership; the engine decides if it is allowed
            let started = self.macros.start(id, intensity, ttl_ms, now_ms)?;
            self.limiter.reset();
            return Ok(started);
        }
        // Validate before tearing down the current owner
        let mut engine = MacroEngine::new();
        let started = engine.start(id, intensity, ttl_ms, now_ms)?;
        self.take_ownership(MotionOwner::Macro);
        self.macros = engine;
        Ok(started)
    }

    /// Cancel any running macro and stop. Always succeeds.
    pub fn cancel_macro(&mut self) {
        if self.owner == MotionOwner::Macro {
            self.stop();
        } else {
            self.macros.cancel();
        }
    }

    /// Unconditional stop from any owner: zero now, driver to standby.
    pub fn stop(&mut self) {
        if self.owner != MotionOwner::Stopped {
            info!("Motion stopped (was {:?})", self.owner);
        }
        self.halt();
    }

    fn halt(&mut self) {
        self.neutralize();
        self.hw.standby();
        self.owner = MotionOwner::Stopped;
    }

    /// Hard stop to standby that leaves the controller idle.
    pub fn standby(&mut self) {
        self.neutralize();
        self.hw.standby();
        self.owner = MotionOwner::Idle;
    }

    /// Back to power-on state after a watchdog restart. Limiter overrides
    /// set over the wire are forgotten.
    pub fn restart(&mut self) {
        self.standby();
        self.limiter = DriveLimiter::new();
    }

    pub fn update_battery(&mut self, mv: Option<u16>) {
        self.limiter.update_battery(mv);
    }

    /// One control pass. `outputs_allowed` is false while the startup
    /// lockout holds, in which case the driver stays in standby.
    pub fn tick(&mut self, now_ms: u32, outputs_allowed: bool) -> TickOutcome {
        let mut outcome = TickOutcome::Running;
        let target = match self.owner {
            MotionOwner::Idle | MotionOwner::Stopped => WheelOutputs::zero(),
            MotionOwner::Direct => self.direct,
            MotionOwner::Setpoint => match self.setpoint {
                Some(sp) if !sp.is_expired(now_ms) => mix(sp.v.into(), sp.w.into()),
                _ => {
                    // Deadman: the stream went quiet, routine
                    debug!("Setpoint TTL expired, stopping");
                    self.halt();
                    return TickOutcome::SetpointExpired;
                }
            },
            MotionOwner::Macro => match self.macros.tick(now_ms) {
                MacroTick::Drive { v, w } => mix(v.into(), w.into()),
                MacroTick::Completed => {
                    self.neutralize();
                    self.owner = MotionOwner::Idle;
                    outcome = TickOutcome::MacroCompleted;
                    WheelOutputs::zero()
                }
                MacroTick::Expired => {
                    self.halt();
                    return TickOutcome::MacroExpired;
                }
                MacroTick::Idle => {
                    self.halt();
                    return TickOutcome::Running;
                }
            },
        };
        self.commanded = target;

        if !outputs_allowed {
            self.hw.standby();
            self.limiter.reset();
            return outcome;
        }
        if target.is_zero() && matches!(self.owner, MotionOwner::Idle | MotionOwner::Stopped) {
            if !self.hw.outputs().is_zero() {
                self.hw.write_motors(WheelOutputs::zero());
            }
            self.limiter.reset();
            return outcome;
        }
        if !self.hw.is_enabled() {
            self.hw.enable();
        }
        let limited = self.limiter.apply(target);
        self.hw.write_motors(limited);
        outcome
    }

    pub fn owner(&self) -> MotionOwner {
        self.owner
    }

    /// Outputs last written to the motors, after limiting
    pub fn outputs(&self) -> WheelOutputs {
        self.hw.outputs()
    }

    /// Outputs the owner asked for on the last tick, before limiting
    pub fn commanded(&self) -> WheelOutputs {
        self.commanded
    }

    pub fn setpoint(&self) -> Option<&SetpointCommand> {
        self.setpoint.as_ref()
    }

    pub fn macros(&self) -> &MacroEngine {
        &self.macros
    }

    pub fn limiter(&self) -> &DriveLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut DriveLimiter {
        &mut self.limiter
    }

    pub fn driver_enabled(&self) -> bool {
        self.hw.is_enabled()
    }

    pub fn set_servo(&mut self, angle: u8) {
        self.hw.set_servo(angle);
    }

    pub fn servo_angle(&self) -> u8 {
        self.hw.servo_angle()
    }

    /// Cycle the driver standby pin (init sequence)
    pub fn pulse_standby(&mut self, high: bool) {
        if high {
            self.hw.enable();
        } else {
            self.hw.standby();
        }
    }

    pub fn actuators(&self) -> &Actuators<P> {
        &self.hw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::hal::SimPins;

    const TICK_MS: u32 = 20;

    fn controller() -> MotionController<SimPins> {
        let mut mc = MotionController::new(Actuators::new(SimPins::default()));
        // Flat response so tests can read exact values
        mc.limiter_mut().configure(4, 0).unwrap();
        mc.limiter_mut().configure(1, (1 << 8) | 1).unwrap();
        mc.limiter_mut().configure(2, 50).unwrap();
        mc.limiter_mut().configure(3, 50).unwrap();
        mc
    }

    fn settle(mc: &mut MotionController<SimPins>, mut now: u32, ticks: u32) -> u32 {
        for _ in 0..ticks {
            mc.tick(now, true);
            now += TICK_MS;
        }
        now
    }

    #[test]
    fn test_setpoint_drives_mixed_outputs() {
        let mut mc = controller();
        mc.set_setpoint(200, 0, Some(1000), 0).unwrap();
        assert_eq!(mc.owner(), MotionOwner::Setpoint);
        settle(&mut mc, 0, 10);
        assert_eq!(mc.commanded(), WheelOutputs::new(200, 200));
        assert_eq!(mc.outputs(), WheelOutputs::new(200, 200));

        mc.set_setpoint(0, 200, Some(1000), 200).unwrap();
        settle(&mut mc, 200, 15);
        assert_eq!(mc.outputs(), WheelOutputs::new(200, -200));
    }

    #[test]
    fn test_setpoint_deadman() {
        let mut mc = controller();
        mc.set_setpoint(150, 0, Some(200), 0).unwrap();
        assert_eq!(mc.tick(180, true), TickOutcome::Running);
        assert!(!mc.outputs().is_zero());
        assert_eq!(mc.tick(200, true), TickOutcome::SetpointExpired);
        assert_eq!(mc.owner(), MotionOwner::Stopped);
        assert!(mc.outputs().is_zero());
        assert!(!mc.driver_enabled());
    }

    #[test]
    fn test_refresh_replaces_deadline() {
        let mut mc = controller();
        mc.set_setpoint(150, 0, Some(500), 0).unwrap();
        mc.set_setpoint(150, 0, Some(150), 100).unwrap();
        // Old deadline was 500, new one is 250
        assert_eq!(mc.tick(240, true), TickOutcome::Running);
        assert_eq!(mc.tick(250, true), TickOutcome::SetpointExpired);
    }

    #[test]
    fn test_streaming_scenario() {
        let mut mc = controller();
        let mut now = 0;
        let mut next_send = 0;
        let mut last_send = 0;
        // 3 s of setpoints every 50 ms, control ticks every 20 ms
        while now < 3000 {
            if now >= next_send {
                mc.set_setpoint(150, 0, Some(200), now).unwrap();
                last_send = now;
                next_send += 50;
            }
            mc.tick(now, true);
            if now >= 100 {
                assert!(!mc.outputs().is_zero(), "stalled at {now}");
            }
            now += TICK_MS;
        }
        while now <= last_send + 200 {
            mc.tick(now, true);
            now += TICK_MS;
        }
        assert!(mc.outputs().is_zero());
        assert_eq!(mc.owner(), MotionOwner::Stopped);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut mc = controller();
        assert_eq!(mc.set_setpoint(300, 0, None, 0), Err(MotionError::OutOfRange(300)));
        assert_eq!(mc.set_setpoint(0, 0, Some(100), 0), Err(MotionError::TtlOutOfRange(100)));
        assert_eq!(mc.set_direct(0, -256), Err(MotionError::OutOfRange(-256)));
        assert_eq!(mc.owner(), MotionOwner::Idle);
    }

    #[test]
    fn test_default_ttl() {
        let mut mc = controller();
        mc.set_setpoint(100, 0, None, 0).unwrap();
        assert_eq!(mc.setpoint().unwrap().ttl_ms, SETPOINT_TTL_DEFAULT_MS);
    }

    #[test]
    fn test_direct_ignores_ttl() {
        let mut mc = controller();
        mc.set_direct(120, -120).unwrap();
        let now = settle(&mut mc, 0, 500);
        assert_eq!(mc.owner(), MotionOwner::Direct);
        assert_eq!(mc.outputs(), WheelOutputs::new(120, -120));
        mc.tick(now, true);
        assert_eq!(mc.pins_left_right(), (120, -120));
    }

    #[test]
    fn test_handover_neutralizes_first() {
        let mut mc = controller();
        mc.set_direct(200, 200).unwrap();
        settle(&mut mc, 0, 10);
        mc.set_setpoint(0, 0, Some(500), 200).unwrap();
        // Zero was written during the handover, before any setpoint output
        assert!(mc.outputs().is_zero());
        assert_eq!(mc.owner(), MotionOwner::Setpoint);
    }

    #[test]
    fn test_stop_from_macro_mid_step() {
        let mut mc = controller();
        mc.start_macro(1, 0, Some(5000), 0).unwrap();
        settle(&mut mc, 0, 20);
        assert!(!mc.outputs().is_zero());
        mc.stop();
        assert_eq!(mc.owner(), MotionOwner::Stopped);
        assert!(mc.outputs().is_zero());
        assert!(!mc.macros().is_active());
    }

    #[test]
    fn test_macro_cancel_scenario() {
        let mut mc = controller();
        mc.start_macro(2, 0, Some(5000), 0).unwrap();
        let now = settle(&mut mc, 0, 75);
        assert_eq!(mc.owner(), MotionOwner::Macro);
        mc.cancel_macro();
        mc.tick(now, true);
        assert!(matches!(mc.owner(), MotionOwner::Stopped | MotionOwner::Idle));
        assert!(mc.outputs().is_zero());
    }

    #[test]
    fn test_macro_completion_returns_idle() {
        let mut mc = controller();
        mc.start_macro(4, 0, Some(5000), 0).unwrap();
        let mut now = 0;
        let mut completed = false;
        while now <= 3000 {
            if mc.tick(now, true) == TickOutcome::MacroCompleted {
                completed = true;
            }
            now += TICK_MS;
        }
        assert!(completed);
        assert_eq!(mc.owner(), MotionOwner::Idle);
    }

    #[test]
    fn test_failed_macro_start_keeps_owner() {
        let mut mc = controller();
        mc.set_direct(100, 100).unwrap();
        assert!(mc.start_macro(42, 0, None, 0).is_err());
        assert_eq!(mc.owner(), MotionOwner::Direct);
    }

    #[test]
    fn test_lockout_holds_standby() {
        let mut mc = controller();
        mc.set_direct(100, 100).unwrap();
        mc.tick(0, false);
        assert!(!mc.driver_enabled());
        assert_eq!(mc.pins_left_right(), (0, 0));
    }

    #[test]
    fn test_mutual_exclusion() {
        let mut mc = controller();
        mc.start_macro(3, 0, None, 0).unwrap();
        settle(&mut mc, 0, 5);
        mc.set_setpoint(50, 0, Some(300), 100).unwrap();
        assert!(!mc.macros().is_active());
        assert_eq!(mc.owner(), MotionOwner::Setpoint);
        mc.set_direct(10, 10).unwrap();
        assert!(mc.setpoint().is_none());
        assert_eq!(mc.owner(), MotionOwner::Direct);
    }

    fn stock_controller() -> MotionController<SimPins> {
        MotionController::new(Actuators::new(SimPins::default()))
    }

    /// Refresh the setpoint every tick so the deadman never fires
    fn stream(mc: &mut MotionController<SimPins>, v: i32, w: i32, mut now: u32, ticks: u32) -> u32 {
        for _ in 0..ticks {
            mc.set_setpoint(v, w, Some(500), now).unwrap();
            mc.tick(now, true);
            now += TICK_MS;
        }
        now
    }

    #[test]
    fn test_stock_limiter_tracks_reversal() {
        let mut mc = stock_controller();
        let now = stream(&mut mc, 150, 0, 0, 40);
        assert_eq!(mc.outputs(), WheelOutputs::new(150, 150));
        stream(&mut mc, -150, 0, now, 40);
        assert_eq!(mc.outputs(), WheelOutputs::new(-150, -150));
    }

    #[test]
    fn test_stock_limiter_setpoint_to_zero() {
        let mut mc = stock_controller();
        let now = stream(&mut mc, 150, 0, 0, 40);
        stream(&mut mc, 0, 0, now, 20);
        assert_eq!(mc.owner(), MotionOwner::Setpoint);
        assert!(mc.outputs().is_zero());
    }

    #[test]
    fn test_stock_limiter_direct_to_zero() {
        let mut mc = stock_controller();
        mc.set_direct(100, 100).unwrap();
        let now = settle(&mut mc, 0, 30);
        assert_eq!(mc.outputs(), WheelOutputs::new(100, 100));
        mc.set_direct(0, 0).unwrap();
        settle(&mut mc, now, 20);
        assert!(mc.outputs().is_zero());
    }

    #[test]
    fn test_stock_limiter_wiggle_swings_both_ways() {
        let mut mc = stock_controller();
        mc.start_macro(3, 0, Some(5000), 0).unwrap();
        let mut right = Vec::new();
        let mut now = 0;
        while now < 900 {
            mc.tick(now, true);
            right.push(mc.outputs().right);
            now += TICK_MS;
        }
        assert!(right.iter().any(|&r| r < 0));
        assert!(right.iter().any(|&r| r > 0));
    }

    impl MotionController<SimPins> {
        fn pins_left_right(&self) -> (i16, i16) {
            let pins = self.actuators().pins();
            (pins.left(), pins.right())
        }
    }
}
