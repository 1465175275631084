// Optional sensors sampled by the slow task
//
// Every sensor may be absent. Reads happen only from the 10 Hz poll; command
// handlers see the cached values and never wait on hardware.

use tracing::debug;

/// One pass worth of raw readings. `None` means the sensor is absent or did
/// not answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorReadings {
    pub distance_cm: Option<u16>,
    pub line: Option<[u16; 3]>,
    pub battery_mv: Option<u16>,
    pub imu_present: bool,
}

/// Board sensor access. Each read must return promptly; a slow device
/// reports `None` rather than blocking.
pub trait SensorSuite {
    fn read_distance_cm(&mut self) -> Option<u16>;
    fn read_line(&mut self) -> Option<[u16; 3]>;
    fn read_battery_mv(&mut self) -> Option<u16>;

    fn imu_present(&mut self) -> bool {
        false
    }
}

/// Line sensor channel selected by `D1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineChannel {
    Left = 0,
    Middle = 1,
    Right = 2,
}

impl LineChannel {
    pub fn from_selector(d1: i32) -> Option<Self> {
        match d1 {
            0 => Some(Self::Left),
            1 => Some(Self::Middle),
            2 => Some(Self::Right),
            _ => None,
        }
    }
}

/// Latest readings, refreshed by [`SensorCache::poll`].
#[derive(Debug, Clone, Default)]
pub struct SensorCache {
    readings: SensorReadings,
    polled_at_ms: Option<u32>,
}

impl SensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample every sensor once.
    pub fn poll<S: SensorSuite>(&mut self, suite: &mut S, now_ms: u32) {
        let readings = SensorReadings {
            distance_cm: suite.read_distance_cm(),
            line: suite.read_line(),
            battery_mv: suite.read_battery_mv(),
            imu_present: suite.imu_present(),
        };
        if readings.battery_mv.is_none() && self.readings.battery_mv.is_some() {
            debug!("Battery monitor stopped answering");
        }
        self.readings = readings;
        self.polled_at_ms = Some(now_ms);
    }

    pub fn readings(&self) -> &SensorReadings {
        &self.readings
    }

    pub fn has_sample(&self) -> bool {
        self.polled_at_ms.is_some()
    }

    /// Distance in cm, 0 when unavailable
    pub fn distance_cm(&self) -> u16 {
        self.readings.distance_cm.unwrap_or(0)
    }

    /// Obstacle closer than the threshold. A missing or zero echo is never
    /// an obstacle.
    pub fn obstacle_within(&self, threshold_cm: u16) -> bool {
        matches!(self.readings.distance_cm, Some(d) if d > 0 && d <= threshold_cm)
    }

    pub fn line(&self, channel: LineChannel) -> u16 {
        self.readings.line.map_or(0, |l| l[channel as usize])
    }

    pub fn battery_mv(&self) -> Option<u16> {
        self.readings.battery_mv
    }

    pub fn imu_present(&self) -> bool {
        self.readings.imu_present
    }
}

/// Scripted sensors for simulation and tests.
#[derive(Debug, Clone)]
pub struct SimSensors {
    pub distance_cm: Option<u16>,
    pub line: Option<[u16; 3]>,
    pub battery_mv: Option<u16>,
    pub imu: bool,
    pub reads: u32,
}

impl Default for SimSensors {
    fn default() -> Self {
        Self {
            distance_cm: Some(120),
            line: Some([80, 650, 90]),
            battery_mv: Some(7800),
            imu: false,
            reads: 0,
        }
    }
}

impl SensorSuite for SimSensors {
    fn read_distance_cm(&mut self) -> Option<u16> {
        self.reads += 1;
        self.distance_cm
    }

    fn read_line(&mut self) -> Option<[u16; 3]> {
        self.reads += 1;
        self.line
    }

    fn read_battery_mv(&mut self) -> Option<u16> {
        self.reads += 1;
        self.battery_mv
    }

    fn imu_present(&mut self) -> bool {
        self.imu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_starts_empty() {
        let cache = SensorCache::new();
        assert!(!cache.has_sample());
        assert_eq!(cache.distance_cm(), 0);
        assert_eq!(cache.battery_mv(), None);
        assert!(!cache.obstacle_within(20));
    }

    #[test]
    fn test_poll_fills_cache() {
        let mut sim = SimSensors::default();
        let mut cache = SensorCache::new();
        cache.poll(&mut sim, 100);
        assert!(cache.has_sample());
        assert_eq!(cache.distance_cm(), 120);
        assert_eq!(cache.line(LineChannel::Middle), 650);
        assert_eq!(cache.battery_mv(), Some(7800));
        assert_eq!(sim.reads, 3);
    }

    #[test]
    fn test_obstacle_threshold() {
        let mut sim = SimSensors {
            distance_cm: Some(15),
            ..SimSensors::default()
        };
        let mut cache = SensorCache::new();
        cache.poll(&mut sim, 0);
        assert!(cache.obstacle_within(20));

        sim.distance_cm = Some(0);
        cache.poll(&mut sim, 100);
        assert!(!cache.obstacle_within(20));

        sim.distance_cm = None;
        cache.poll(&mut sim, 200);
        assert!(!cache.obstacle_within(20));
    }

    #[test]
    fn test_missing_line_sensor_reads_zero() {
        let mut sim = SimSensors {
            line: None,
            ..SimSensors::default()
        };
        let mut cache = SensorCache::new();
        cache.poll(&mut sim, 0);
        assert_eq!(cache.line(LineChannel::Right), 0);
    }

    #[test]
    fn test_line_selector() {
        assert_eq!(LineChannel::from_selector(2), Some(LineChannel::Right));
        assert_eq!(LineChannel::from_selector(3), None);
    }
}
