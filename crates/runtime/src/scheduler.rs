use std::time::Instant;

/// Something driven once per animation frame.
///
/// `tick` receives the real elapsed time since the previous tick and must
/// return without blocking. Cancellation is simply not calling it again.
pub trait Tick {
    fn tick(&mut self, real_delta_ms: f64);
}

/// Turns wall-clock instants into per-frame real deltas.
#[derive(Debug, Default)]
pub struct FrameDriver {
    last: Option<Instant>,
    frames: u64,
}

impl FrameDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Real milliseconds since the previous call. The first call reports 0.
    pub fn delta_ms(&mut self, now: Instant) -> f64 {
        let dt = match self.last {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f64() * 1000.0,
            None => 0.0,
        };
        self.last = Some(now);
        dt
    }

    pub fn drive(&mut self, now: Instant, target: &mut impl Tick) {
        let dt = self.delta_ms(now);
        self.frames += 1;
        target.tick(dt);
    }
}
