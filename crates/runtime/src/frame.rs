use foundation::time::Time;

/// Per-tick frame metadata produced by the [`VirtualClock`](crate::VirtualClock).
///
/// This is the primary timebase handed to everything downstream of the
/// clock. It is small and `Copy` so it can be logged or replayed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frame {
    /// 0-based frame index within the current session.
    pub index: u64,
    /// Real elapsed time after clamping (milliseconds).
    pub real_dt_ms: f64,
    /// Simulated time advanced by this frame (milliseconds, signed).
    pub sim_dt_ms: f64,
    /// Simulated time at the end of the frame.
    pub time: Time,
}

impl Frame {
    pub fn new(index: u64, real_dt_ms: f64, sim_dt_ms: f64, time: Time) -> Self {
        Self {
            index,
            real_dt_ms,
            sim_dt_ms,
            time,
        }
    }

    /// Simulated seconds since the window start.
    pub fn sim_seconds(&self) -> f64 {
        self.time.0
    }
}
