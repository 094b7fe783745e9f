use foundation::time::Time;

use crate::frame::Frame;

/// Maps real frame deltas to simulated elapsed time.
///
/// Simulated time is kept in milliseconds since the window start and never
/// goes below zero. Each tick clamps the real delta (so a backgrounded tab
/// does not produce a multi-second jump), scales it by the speed multiplier
/// and accumulates it.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    sim_ms: f64,
    speed: f64,
    playing: bool,
    max_frame_delta_ms: f64,
    next_frame: u64,
}

impl VirtualClock {
    pub fn new(speed: f64, max_frame_delta_ms: f64) -> Self {
        Self {
            sim_ms: 0.0,
            speed,
            playing: true,
            max_frame_delta_ms: max_frame_delta_ms.max(0.0),
            next_frame: 0,
        }
    }

    pub fn sim_millis(&self) -> f64 {
        self.sim_ms
    }

    pub fn time(&self) -> Time {
        Time::from_millis(self.sim_ms)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Takes effect from the next tick; already-elapsed time is not rescaled.
    pub fn set_speed(&mut self, speed: f64) {
        if speed.is_finite() {
            self.speed = speed;
        }
    }

    pub fn max_frame_delta_ms(&self) -> f64 {
        self.max_frame_delta_ms
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn toggle(&mut self) {
        self.playing = !self.playing;
    }

    /// Jump within the current window. Nothing downstream is invalidated.
    pub fn scrub_to(&mut self, sim_ms: f64) {
        if sim_ms.is_finite() {
            self.sim_ms = sim_ms.max(0.0);
        }
    }

    /// Restart at zero relative to a new window start.
    pub fn reset(&mut self) {
        self.sim_ms = 0.0;
        self.next_frame = 0;
    }

    pub fn tick(&mut self, real_delta_ms: f64) -> Frame {
        let real_dt_ms = if real_delta_ms.is_finite() {
            real_delta_ms.clamp(0.0, self.max_frame_delta_ms)
        } else {
            0.0
        };

        let before = self.sim_ms;
        if self.playing {
            self.sim_ms = (self.sim_ms + real_dt_ms * self.speed).max(0.0);
        }

        let index = self.next_frame;
        self.next_frame += 1;
        Frame::new(index, real_dt_ms, self.sim_ms - before, self.time())
    }
}
