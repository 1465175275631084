// Macro engine: timed multi-step motion sequences
//
// Each macro is a fixed list of {v, w, duration} steps scaled by the caller's
// intensity. The engine only computes targets; the motion controller applies
// them. A macro carries its own TTL measured from start, independent of the
// step timeline.

use tracing::{debug, info};

use crate::config::{MACRO_TTL_DEFAULT_MS, MACRO_TTL_MAX_MS, MACRO_TTL_MIN_MS};

/// Full-scale intensity; steps are defined at this scale
pub const INTENSITY_FULL: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroStep {
    pub v: i16,
    pub w: i16,
    pub duration_ms: u16,
}

const fn step(v: i16, w: i16, duration_ms: u16) -> MacroStep {
    MacroStep { v, w, duration_ms }
}

const FIGURE_EIGHT: [MacroStep; 5] = [
    step(150, 75, 2000),
    step(150, -75, 2000),
    step(150, 75, 2000),
    step(150, -75, 2000),
    step(0, 0, 500),
];

const SPIN_360: [MacroStep; 2] = [step(0, 250, 1800), step(0, 0, 500)];

const WIGGLE: [MacroStep; 5] = [
    step(100, 150, 300),
    step(100, -150, 300),
    step(100, 150, 300),
    step(100, -150, 300),
    step(0, 0, 500),
];

const FORWARD_THEN_STOP: [MacroStep; 2] = [step(200, 0, 2000), step(0, 0, 500)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MacroId {
    FigureEight = 1,
    Spin360 = 2,
    Wiggle = 3,
    ForwardThenStop = 4,
}

impl MacroId {
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Self::FigureEight),
            2 => Some(Self::Spin360),
            3 => Some(Self::Wiggle),
            4 => Some(Self::ForwardThenStop),
            _ => None,
        }
    }

    pub fn steps(self) -> &'static [MacroStep] {
        match self {
            Self::FigureEight => &FIGURE_EIGHT,
            Self::Spin360 => &SPIN_360,
            Self::Wiggle => &WIGGLE,
            Self::ForwardThenStop => &FORWARD_THEN_STOP,
        }
    }
}

/// Error types for macro start requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MacroError {
    #[error("Unknown macro id {0}")]
    UnknownMacro(i32),

    #[error("Intensity {0} outside 0..=255")]
    BadIntensity(i32),

    #[error("Macro TTL {0}ms outside {min}..={max}", min = MACRO_TTL_MIN_MS, max = MACRO_TTL_MAX_MS)]
    TtlOutOfRange(u32),

    #[error("Active macro is settling and cannot be replaced")]
    Finishing,
}

/// Playback state of the running macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroState {
    pub id: MacroId,
    pub step_index: usize,
    pub step_started_ms: u32,
    pub step_duration_ms: u32,
    pub target_v: i16,
    pub target_w: i16,
    pub intensity: u8,
    pub ttl_ms: u32,
    pub started_ms: u32,
}

impl MacroState {
    fn enter_step(&mut self, index: usize, now_ms: u32) {
        let step = self.id.steps()[index];
        self.step_index = index;
        self.step_started_ms = now_ms;
        self.step_duration_ms = u32::from(step.duration_ms);
        self.target_v = scale(step.v, self.intensity);
        self.target_w = scale(step.w, self.intensity);
    }

    /// The last step is the settle-to-zero step
    pub fn is_finishing(&self) -> bool {
        self.step_index + 1 >= self.id.steps().len()
    }
}

fn scale(value: i16, intensity: u8) -> i16 {
    (i32::from(value) * i32::from(intensity) / i32::from(INTENSITY_FULL)) as i16
}

/// Outcome of one engine tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroTick {
    Idle,
    Drive { v: i16, w: i16 },
    /// Ran through every step
    Completed,
    /// Macro TTL elapsed first
    Expired,
}

#[derive(Debug, Clone, Default)]
pub struct MacroEngine {
    state: Option<MacroState>,
}

impl MacroEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a macro, replacing any active one that is not yet settling.
    ///
    /// Intensity 0 selects full scale; a missing TTL gets the default.
    pub fn start(
        &mut self,
        id: i32,
        intensity: i32,
        ttl_ms: Option<u32>,
        now_ms: u32,
    ) -> Result<MacroId, MacroError> {
        let macro_id = MacroId::from_id(id).ok_or(MacroError::UnknownMacro(id))?;
        let intensity = match intensity {
            0 => INTENSITY_FULL,
            1..=255 => intensity as u8,
            other => return Err(MacroError::BadIntensity(other)),
        };
        let ttl_ms = ttl_ms.unwrap_or(MACRO_TTL_DEFAULT_MS);
        if !(MACRO_TTL_MIN_MS..=MACRO_TTL_MAX_MS).contains(&ttl_ms) {
            return Err(MacroError::TtlOutOfRange(ttl_ms));
        }
        if self.state.as_ref().is_some_and(MacroState::is_finishing) {
            return Err(MacroError::Finishing);
        }

        let mut state = MacroState {
            id: macro_id,
            step_index: 0,
            step_started_ms: now_ms,
            step_duration_ms: 0,
            target_v: 0,
            target_w: 0,
            intensity,
            ttl_ms,
            started_ms: now_ms,
        };
        state.enter_step(0, now_ms);
        info!(
            "Macro {:?} started (intensity {}, ttl {}ms)",
            macro_id, intensity, ttl_ms
        );
        self.state = Some(state);
        Ok(macro_id)
    }

    /// Drop the active macro. Returns whether one was running.
    pub fn cancel(&mut self) -> bool {
        match self.state.take() {
            Some(state) => {
                debug!("Macro {:?} cancelled at step {}", state.id, state.step_index);
                true
            }
            None => false,
        }
    }

    /// Advance the timeline and report the current target.
    pub fn tick(&mut self, now_ms: u32) -> MacroTick {
        let Some(state) = self.state.as_mut() else {
            return MacroTick::Idle;
        };
        if now_ms.wrapping_sub(state.started_ms) >= state.ttl_ms {
            debug!("Macro {:?} TTL expired", state.id);
            self.state = None;
            return MacroTick::Expired;
        }
        while now_ms.wrapping_sub(state.step_started_ms) >= state.step_duration_ms {
            let next = state.step_index + 1;
            if next >= state.id.steps().len() {
                info!("Macro {:?} completed", state.id);
                self.state = None;
                return MacroTick::Completed;
            }
            let started = state.step_started_ms.wrapping_add(state.step_duration_ms);
            state.enter_step(next, started);
        }
        MacroTick::Drive {
            v: state.target_v,
            w: state.target_w,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&MacroState> {
        self.state.as_ref()
    }
}
