//! Virtual playback clock.
//!
//! Maps elapsed wall-clock time, scaled by speed, to a position on the
//! playback timeline. The clock knows nothing about events; the engine
//! asks it to advance and reacts when the window end is reached.

use crate::error::{PlaybackError, Result};
use crate::timing::MetricTime;
use std::time::Duration;

/// Lifecycle of a playback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    /// Never started.
    Created,
    /// The clock advances and events are dispatched.
    Running,
    /// Halted by `pause`; notes keep sounding.
    Paused,
    /// Halted by `stop`.
    Stopped,
    /// Reached the end of a non-looping pass.
    Finished,
}

/// Result of advancing the clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    /// Position after the tick.
    pub position: MetricTime,
    /// The window end has been reached.
    pub reached_end: bool,
}

/// Scaled, seekable clock confined to a playback window.
///
/// The window defaults to the data bounds: start at zero, end at the data
/// duration. Explicit bounds override either side.
#[derive(Clone, Debug)]
pub struct VirtualClock {
    position: MetricTime,
    speed: f64,
    running: bool,
    window_start: Option<MetricTime>,
    window_end: Option<MetricTime>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            position: MetricTime::ZERO,
            speed: 1.0,
            running: false,
            window_start: None,
            window_end: None,
        }
    }

    pub fn position(&self) -> MetricTime {
        self.position
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Set the speed multiplier. Must be finite and positive.
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        validate_speed(speed)?;
        self.speed = speed;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn pause(&mut self) {
        self.running = false;
    }

    pub fn window_start(&self) -> Option<MetricTime> {
        self.window_start
    }

    pub fn window_end(&self) -> Option<MetricTime> {
        self.window_end
    }

    /// Set the window start; `None` restores the data bound.
    pub fn set_window_start(&mut self, start: Option<MetricTime>) -> Result<()> {
        if let Some(start) = start {
            let end = self.window_end.unwrap_or(MetricTime::MAX);
            if start < MetricTime::ZERO || end < start {
                return Err(PlaybackError::InvalidWindow { start, end });
            }
        }
        self.window_start = start;
        Ok(())
    }

    /// Set the window end; `None` restores the data bound.
    pub fn set_window_end(&mut self, end: Option<MetricTime>) -> Result<()> {
        if let Some(end) = end {
            let start = self.window_start.unwrap_or(MetricTime::ZERO);
            if end < start {
                return Err(PlaybackError::InvalidWindow { start, end });
            }
        }
        self.window_end = end;
        Ok(())
    }

    /// Effective `(start, end)` window for data of the given duration.
    pub fn bounds(&self, duration: MetricTime) -> (MetricTime, MetricTime) {
        resolve(self.window_start, self.window_end, duration)
    }

    /// Jump to `target`, clamped into the window. Returns the new position.
    pub fn seek(&mut self, target: MetricTime, duration: MetricTime) -> MetricTime {
        let (start, end) = self.bounds(duration);
        self.position = target.clamp_to(start, end);
        self.position
    }

    /// Advance by `wall_delta` scaled by speed.
    ///
    /// The position never passes the window end and never moves backwards;
    /// if the end was pulled in below the position, the tick only reports
    /// that the end has been reached.
    pub fn tick(&mut self, wall_delta: Duration, duration: MetricTime) -> Tick {
        let (_, end) = self.bounds(duration);
        if self.running && self.position < end {
            let advanced = self.position + MetricTime::from_duration(wall_delta).scale(self.speed);
            self.position = advanced.min(end);
        }
        Tick {
            position: self.position,
            reached_end: self.position >= end,
        }
    }

    /// Move back to the window start for the next loop pass.
    pub fn wrap(&mut self, duration: MetricTime) -> MetricTime {
        let (start, _) = self.bounds(duration);
        self.position = start;
        start
    }
}

fn resolve(
    start: Option<MetricTime>,
    end: Option<MetricTime>,
    duration: MetricTime,
) -> (MetricTime, MetricTime) {
    let start = start.unwrap_or(MetricTime::ZERO);
    let end = end.unwrap_or(duration).max(start);
    (start, end)
}

/// Check a speed multiplier.
pub fn validate_speed(speed: f64) -> Result<()> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(PlaybackError::InvalidSpeed(speed))
    }
}
