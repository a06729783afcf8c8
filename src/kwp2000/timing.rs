use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

pub const P1_DEFAULT_ECU_INTER_BYTE_MAX: u64 = 20;
pub const P2_DEFAULT_ECU_RESPONSE_MIN: u64 = 25;
pub const P2_DEFAULT_ECU_RESPONSE_MAX: u64 = 50;
/// Default P2 max used on connect, long enough to survive reconnecting after fast timings
pub const P2_CONNECT_ECU_RESPONSE_MAX: u64 = 1000;
pub const P3_DEFAULT_TESTER_REQUEST_MIN: u64 = 55;
pub const P3_DEFAULT_TESTER_REQUEST_MAX: u64 = 5000;
pub const P4_DEFAULT_TESTER_INTER_BYTE_MIN: u64 = 5;

/// Minimum gap the ECU expects between a min and max timing value
const MIN_MAX_SPACING: u64 = 13;

/// Where the interface's current timing parameters came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingMode {
    Default,
    Current,
    Limits,
    #[default]
    Unknown,
}

/// All values are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParameters {
    pub p1_max: u64,
    pub p2_min: u64,
    pub p2_max: u64,
    pub p3_min: u64,
    pub p3_max: u64,
    pub p4_min: u64,
}

impl Default for TimingParameters {
    fn default() -> Self {
        Self {
            p1_max: P1_DEFAULT_ECU_INTER_BYTE_MAX,
            p2_min: P2_DEFAULT_ECU_RESPONSE_MIN,
            p2_max: P2_CONNECT_ECU_RESPONSE_MAX,
            p3_min: P3_DEFAULT_TESTER_REQUEST_MIN,
            p3_max: P3_DEFAULT_TESTER_REQUEST_MAX,
            p4_min: P4_DEFAULT_TESTER_INTER_BYTE_MIN,
        }
    }
}

impl TimingParameters {
    /// Applies the ordering the ECU checks when timing values are set.
    pub fn enforce_interval_requirements(&mut self) {
        self.p2_max = self.p2_max.max(self.p2_min + MIN_MAX_SPACING);
        self.p3_min = self.p3_min.max(self.p4_min);
        self.p3_max = self.p3_max.max(self.p3_min + MIN_MAX_SPACING);
    }

    /// Wire form used by AccessTimingParameters, P1 is not transmitted.
    ///
    /// P2 min, P3 min and P4 min count half milliseconds, P2 max counts 25ms
    /// and P3 max 250ms steps.
    pub fn to_bytes(&self) -> [u8; 5] {
        fn scaled(value: u64, numerator: u64, denominator: u64) -> u8 {
            (value * numerator / denominator).min(u8::MAX as u64) as u8
        }
        [
            scaled(self.p2_min, 2, 1),
            scaled(self.p2_max, 1, 25),
            scaled(self.p3_min, 2, 1),
            scaled(self.p3_max, 1, 250),
            scaled(self.p4_min, 2, 1),
        ]
    }

    /// Parses the five timing bytes of an AccessTimingParameters response.
    pub fn from_bytes(bytes: &[u8], p1_max: u64) -> Option<Self> {
        let [p2_min, p2_max, p3_min, p3_max, p4_min, ..] = *bytes else {
            return None;
        };
        Some(Self {
            p1_max,
            p2_min: p2_min as u64 / 2,
            p2_max: p2_max as u64 * 25,
            p3_min: p3_min as u64 / 2,
            p3_max: p3_max as u64 * 250,
            p4_min: p4_min as u64 / 2,
        })
    }
}

impl fmt::Display for TimingParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P1Max: {}ms P2Min: {}ms P2Max: {}ms P3Min: {}ms P3Max: {}ms P4Min: {}ms",
            self.p1_max, self.p2_min, self.p2_max, self.p3_min, self.p3_max, self.p4_min
        )
    }
}

/// Restartable timer, stopped until started.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stopwatch {
    started: Option<Instant>,
}

impl Stopwatch {
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Starts the stopwatch unless it is already running
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn restart(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.started = None;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

/// Spins until `deadline`.
///
/// Bit timings on the K-line need sub millisecond accuracy which sleeping
/// cannot give, so this deliberately burns the CPU.
pub fn spin_until(deadline: Instant) {
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

pub fn spin_for(duration: Duration) {
    spin_until(Instant::now() + duration);
}

/// Sleeps for most of `duration` and spins for the rest.
pub fn idle_for(duration: Duration) {
    let deadline = Instant::now() + duration;
    if let Some(sleep) = duration.checked_sub(Duration::from_millis(2)) {
        std::thread::sleep(sleep);
    }
    spin_until(deadline);
}

/// Offsets a duration by a signed amount of milliseconds, clamping at zero.
pub fn offset_duration(base: Duration, offset_ms: f64) -> Duration {
    let millis = base.as_secs_f64() * 1000.0 + offset_ms;
    Duration::from_secs_f64(millis.max(0.0) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_requirements_hold() {
        for p2_min in [0, 25, 200] {
            for p2_max in [0, 10, 1000] {
                for p3_min in [0, 3, 55] {
                    for p4_min in [0, 5, 60] {
                        let mut timing = TimingParameters {
                            p1_max: 20,
                            p2_min,
                            p2_max,
                            p3_min,
                            p3_max: 0,
                            p4_min,
                        };
                        timing.enforce_interval_requirements();
                        assert!(timing.p2_max >= timing.p2_min + 13);
                        assert!(timing.p3_min >= timing.p4_min);
                        assert!(timing.p3_max >= timing.p3_min + 13);
                    }
                }
            }
        }
    }

    #[test]
    fn timing_bytes() {
        let timing = TimingParameters {
            p1_max: 20,
            p2_min: 0,
            p2_max: 50,
            p3_min: 5,
            p3_max: 5000,
            p4_min: 1,
        };
        assert_eq!(timing.to_bytes(), [0x00, 0x02, 0x0A, 0x14, 0x02]);
        assert_eq!(TimingParameters::from_bytes(&timing.to_bytes(), 20), Some(timing));
        assert_eq!(TimingParameters::from_bytes(&[0x00, 0x02], 20), None);
    }

    #[test]
    fn stopwatch_start_does_not_restart() {
        let mut watch = Stopwatch::default();
        assert!(!watch.is_running());
        assert_eq!(watch.elapsed_ms(), 0);

        watch.start();
        std::thread::sleep(Duration::from_millis(5));
        watch.start();
        assert!(watch.elapsed_ms() >= 5);

        watch.reset();
        assert!(!watch.is_running());
    }

    #[test]
    fn negative_offsets_clamp() {
        let bit_time = offset_duration(Duration::from_millis(200), -0.6);
        assert!((bit_time.as_secs_f64() - 0.1994).abs() < 1e-6);
        assert_eq!(offset_duration(Duration::from_millis(1), -5.0), Duration::ZERO);
    }
}
