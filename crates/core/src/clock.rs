//! Frame clock used to drive per-frame timing (delta time, resize rate limiting).

use std::time::{Duration, Instant};

/// Upper bound for a single frame delta. A debugger break or a long
/// swapchain rebuild should not be observed as a multi-second frame.
const MAX_DELTA: Duration = Duration::from_millis(250);

/// Measures frame deltas and counts frames.
#[derive(Debug)]
pub struct FrameClock {
    start: Instant,
    last_tick: Instant,
    last_delta: Duration,
    frame_count: u64,
}

impl FrameClock {
    /// Create a new clock, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            last_delta: Duration::ZERO,
            frame_count: 0,
        }
    }

    /// Total time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Advance the clock by one frame and return the clamped delta.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        self.last_delta = (now - self.last_tick).min(MAX_DELTA);
        self.last_tick = now;
        self.frame_count += 1;
        self.last_delta
    }

    /// Delta of the last [`tick`](Self::tick) in seconds.
    pub fn delta_secs(&self) -> f32 {
        self.last_delta.as_secs_f32()
    }

    /// Number of ticks so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average frames per second since creation.
    pub fn average_fps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.frame_count as f64 / secs
        } else {
            0.0
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_frames() {
        let mut clock = FrameClock::new();
        clock.tick();
        clock.tick();
        assert_eq!(clock.frame_count(), 2);
    }

    #[test]
    fn test_delta_is_clamped() {
        let mut clock = FrameClock::new();
        clock.last_tick = Instant::now() - Duration::from_secs(5);
        let delta = clock.tick();
        assert_eq!(delta, MAX_DELTA);
        assert!((clock.delta_secs() - 0.25).abs() < f32::EPSILON);
    }
}
