// Safety layer: startup lockout, command rate limit, watchdog, hard overrides

use heapless::Deque;
use tracing::{error, info};

use crate::config::{RATE_LIMIT_MAX_COMMANDS, RATE_LIMIT_WINDOW_MS, WATCHDOG_TIMEOUT_MS};
use crate::protocol::command::{N_LEGACY_STANDBY, N_LEGACY_STOP, N_STOP};

/// Command numbers that always resolve to a stop, whatever else is going on
pub const HARD_OVERRIDES: [u16; 3] = [N_STOP, N_LEGACY_STOP, N_LEGACY_STANDBY];

pub fn is_hard_override(number: u16) -> bool {
    HARD_OVERRIDES.contains(&number)
}

/// Sliding-window limiter over command arrival times.
#[derive(Debug)]
pub struct RateLimiter {
    arrivals: Deque<u32, RATE_LIMIT_MAX_COMMANDS>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            arrivals: Deque::new(),
        }
    }

    /// Record an arrival. Returns false when the window is already full;
    /// the command is then dropped, never queued.
    pub fn admit(&mut self, now_ms: u32) -> bool {
        while let Some(&oldest) = self.arrivals.front() {
            if now_ms.wrapping_sub(oldest) >= RATE_LIMIT_WINDOW_MS {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        self.arrivals.push_back(now_ms).is_ok()
    }
}

/// Software model of the hardware watchdog timer.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout_ms: u32,
    last_feed_ms: u32,
}

impl Watchdog {
    pub fn new(now_ms: u32) -> Self {
        Self {
            timeout_ms: WATCHDOG_TIMEOUT_MS,
            last_feed_ms: now_ms,
        }
    }

    pub fn feed(&mut self, now_ms: u32) {
        self.last_feed_ms = now_ms;
    }

    pub fn expired(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.last_feed_ms) >= self.timeout_ms
    }
}

/// Verdict for one inbound command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    RateLimited,
}

/// Gate in front of the router.
#[derive(Debug)]
pub struct SafetyLayer {
    locked: bool,
    rate: RateLimiter,
    watchdog: Watchdog,
}

impl SafetyLayer {
    pub fn new(now_ms: u32) -> Self {
        Self {
            locked: true,
            rate: RateLimiter::new(),
            watchdog: Watchdog::new(now_ms),
        }
    }

    /// Decide whether a structurally valid command may reach the router.
    /// The first admitted command lifts the startup lockout.
    pub fn admit(&mut self, number: u16, now_ms: u32) -> Admission {
        if !is_hard_override(number) && !self.rate.admit(now_ms) {
            return Admission::RateLimited;
        }
        if self.locked {
            info!("Startup lockout released by command {}", number);
            self.locked = false;
        }
        Admission::Accept
    }

    /// Outputs stay forced off until a valid command arrives
    pub fn outputs_locked(&self) -> bool {
        self.locked
    }

    pub fn feed_watchdog(&mut self, now_ms: u32) {
        self.watchdog.feed(now_ms);
    }

    pub fn watchdog_expired(&self, now_ms: u32) -> bool {
        let expired = self.watchdog.expired(now_ms);
        if expired {
            error!("Watchdog expired, restarting");
        }
        expired
    }
}
