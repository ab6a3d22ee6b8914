//! Frame counters and the frame pacing clock.

use std::time::{Duration, Instant};

/// Counters reset every time the VM enters Running.
#[derive(Debug, Clone)]
pub struct PerfCounters {
    started: Instant,
    frames: u64,
    cycles: u64,
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            cycles: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record_frame(&mut self, cycles: u64) {
        self.frames += 1;
        self.cycles += cycles;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Average frame rate since the last reset.
    pub fn fps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.frames as f64 / secs
        }
    }
}

/// Sleeps the CPU thread so frames are presented at the target rate.
///
/// The clock tracks an absolute deadline. If the thread falls more than one frame behind, the
/// deadline is resynchronised instead of trying to catch up.
#[derive(Debug, Clone)]
pub struct PacingClock {
    frame: Duration,
    next: Instant,
}

impl PacingClock {
    pub fn new(target_fps: f64) -> Self {
        Self {
            frame: frame_duration(target_fps),
            next: Instant::now(),
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame
    }

    pub fn set_target_fps(&mut self, target_fps: f64) {
        self.frame = frame_duration(target_fps);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.next = Instant::now() + self.frame;
    }

    pub fn wait(&mut self) {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
            self.next += self.frame;
        } else if now - self.next > self.frame {
            self.next = now + self.frame;
        } else {
            self.next += self.frame;
        }
    }
}

fn frame_duration(target_fps: f64) -> Duration {
    Duration::from_secs_f64(1.0 / target_fps.clamp(1.0, 1000.0))
}
