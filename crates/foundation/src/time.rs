/// Simulated time primitives.
///
/// All animation math runs in simulated seconds measured from the window
/// start; the clock itself keeps milliseconds.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct Time(pub f64); // seconds

impl Time {
    pub fn from_millis(ms: f64) -> Self {
        Time(ms / 1000.0)
    }
}

/// Closed interval of simulated time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TimeSpan {
    pub start: Time,
    pub end: Time,
}

impl TimeSpan {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start: Time(start),
            end: Time(end),
        }
    }

    /// Overlap test against a half-open window `[other.start, other.end)`.
    pub fn overlaps_window(&self, window: &TimeSpan) -> bool {
        self.start.0 < window.end.0 && self.end.0 >= window.start.0
    }

    /// Fraction of the span elapsed at `t`, clamped to `[0, 1]`.
    ///
    /// Empty spans report 1.0 so a zero-length phase reads as complete.
    pub fn progress(&self, t: Time) -> f64 {
        let d = self.end.0 - self.start.0;
        if d <= 0.0 {
            return 1.0;
        }
        ((t.0 - self.start.0) / d).clamp(0.0, 1.0)
    }
}
