//! Frame timing for per-frame shader parameters.

use std::time::{Duration, Instant};

/// Timing snapshot produced once per frame by [`Timer::tick`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTime {
    /// Seconds since the previous tick.
    pub delta: f32,
    /// Seconds since the timer started.
    pub elapsed: f32,
    /// Number of ticks before this one.
    pub frame: u64,
}

/// Monotonic frame clock.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    frames: u64,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frames: 0,
        }
    }

    /// Total time since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Number of frames ticked so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Advance one frame and return its timing.
    pub fn tick(&mut self) -> FrameTime {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;

        let time = FrameTime {
            delta: delta.as_secs_f32(),
            elapsed: (now - self.start).as_secs_f32(),
            frame: self.frames,
        };
        self.frames += 1;
        time
    }

    /// Restart the clock and the frame counter.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
