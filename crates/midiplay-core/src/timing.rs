//! Timing primitives for playback.
//!
//! This module provides the time types shared by every playback component:
//!
//! - [`MetricTime`] - Fixed-point microsecond position on the playback timeline
//! - [`TempoMap`] - Conversion between musical ticks and metric time
//! - [`FixedTempo`] - Constant-tempo [`TempoMap`] implementation

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Metric position or span with microsecond resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricTime {
    micros: i64,
}

impl MetricTime {
    /// Zero metric time constant.
    pub const ZERO: MetricTime = MetricTime { micros: 0 };

    /// Largest representable metric time.
    pub const MAX: MetricTime = MetricTime { micros: i64::MAX };

    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis.saturating_mul(1_000),
        }
    }

    /// Create a metric time from floating-point seconds.
    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self {
            micros: (secs * 1_000_000.0).round() as i64,
        }
    }

    /// Create a metric time from a wall-clock duration.
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: i64::try_from(duration.as_micros()).unwrap_or(i64::MAX),
        }
    }

    #[inline]
    pub const fn as_micros(self) -> i64 {
        self.micros
    }

    #[inline]
    pub fn as_millis_f64(self) -> f64 {
        self.micros as f64 / 1_000.0
    }

    /// Convert to a wall-clock duration; negative values map to zero.
    #[inline]
    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Multiply by a speed factor, rounding to the nearest microsecond.
    #[inline]
    pub fn scale(self, factor: f64) -> Self {
        let scaled = (self.micros as f64 * factor).round();
        if scaled >= i64::MAX as f64 {
            Self::MAX
        } else {
            Self {
                micros: scaled as i64,
            }
        }
    }

    /// Clamp into `[lo, hi]`.
    #[inline]
    pub fn clamp_to(self, lo: MetricTime, hi: MetricTime) -> Self {
        if self < lo {
            lo
        } else if self > hi {
            hi
        } else {
            self
        }
    }
}

impl std::ops::Add for MetricTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            micros: self.micros.saturating_add(rhs.micros),
        }
    }
}

impl std::ops::AddAssign for MetricTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for MetricTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            micros: self.micros.saturating_sub(rhs.micros),
        }
    }
}

impl From<Duration> for MetricTime {
    fn from(value: Duration) -> Self {
        MetricTime::from_duration(value)
    }
}

impl fmt::Display for MetricTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

/// Failure to convert between musical and metric time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TempoError {
    #[error("Tick position {0} does not fit the metric timeline")]
    Overflow(u64),

    #[error("Metric time {0} is negative")]
    NegativeTime(MetricTime),

    #[error("Tempo map has zero ticks per quarter note")]
    ZeroResolution,

    /// Failure reported by a caller-supplied tempo map.
    #[error("Tempo map error: {0}")]
    Custom(String),
}

/// Musical/metric time conversion supplied by the caller.
///
/// Implementations must be pure: the same input always produces the same
/// output, since the scheduler rebuilds its timeline on every mutation.
pub trait TempoMap: Send + Sync {
    /// Convert an absolute tick position into metric time.
    fn to_metric(&self, ticks: u64) -> Result<MetricTime, TempoError>;

    /// Convert a metric position back into ticks.
    fn to_ticks(&self, time: MetricTime) -> Result<u64, TempoError>;
}

/// Tempo map with a single tempo for the whole timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedTempo {
    ticks_per_quarter: u16,
    micros_per_quarter: u64,
}

impl FixedTempo {
    /// Default resolution in ticks per quarter note.
    pub const DEFAULT_TICKS_PER_QUARTER: u16 = 480;

    /// Default tempo (120 BPM).
    pub const DEFAULT_MICROS_PER_QUARTER: u64 = 500_000;

    pub fn new(ticks_per_quarter: u16, micros_per_quarter: u64) -> Self {
        Self {
            ticks_per_quarter,
            micros_per_quarter,
        }
    }

    /// Create a tempo map from beats per minute.
    ///
    /// Non-positive BPM values are clamped to a very slow tempo.
    pub fn from_bpm(ticks_per_quarter: u16, bpm: f64) -> Self {
        let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { 1.0 };
        Self::new(ticks_per_quarter, (60_000_000.0 / bpm).round() as u64)
    }

    /// One tick per millisecond.
    pub fn millis() -> Self {
        Self::new(1_000, 1_000_000)
    }

    pub fn ticks_per_quarter(&self) -> u16 {
        self.ticks_per_quarter
    }

    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.micros_per_quarter as f64
    }
}

impl Default for FixedTempo {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_TICKS_PER_QUARTER,
            Self::DEFAULT_MICROS_PER_QUARTER,
        )
    }
}

impl TempoMap for FixedTempo {
    fn to_metric(&self, ticks: u64) -> Result<MetricTime, TempoError> {
        if self.ticks_per_quarter == 0 {
            return Err(TempoError::ZeroResolution);
        }
        let micros =
            ticks as u128 * self.micros_per_quarter as u128 / self.ticks_per_quarter as u128;
        i64::try_from(micros)
            .map(MetricTime::from_micros)
            .map_err(|_| TempoError::Overflow(ticks))
    }

    fn to_ticks(&self, time: MetricTime) -> Result<u64, TempoError> {
        if self.ticks_per_quarter == 0 {
            return Err(TempoError::ZeroResolution);
        }
        if time < MetricTime::ZERO {
            return Err(TempoError::NegativeTime(time));
        }
        if self.micros_per_quarter == 0 {
            return Ok(0);
        }
        let ticks = time.as_micros() as u128 * self.ticks_per_quarter as u128
            / self.micros_per_quarter as u128;
        Ok(u64::try_from(ticks).unwrap_or(u64::MAX))
    }
}
