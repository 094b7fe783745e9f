use foundation::math::{LngLat, lerp_bearing, lerp_lnglat};
use foundation::time::Time;
use serde::{Deserialize, Serialize};

use crate::trip::CompiledTrip;

/// Forward steps tried from the cursor before falling back to binary search.
const MAX_FORWARD_SCAN: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripPhase {
    Hidden,
    FadingIn,
    Moving,
    FadingOut,
}

/// Mutable per-frame fields of one live trip.
///
/// Owned by the orchestrating thread; only [`interpolate`] writes the
/// position/bearing/phase fields. `last_segment_index` is a search hint and
/// never changes what a frame produces.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    pub current_position: LngLat,
    pub current_bearing: f64,
    pub current_phase: TripPhase,
    pub current_phase_progress: f64,
    pub is_visible: bool,
    pub is_selected: bool,
    pub last_segment_index: usize,
}

/// The observable output of a frame for one trip.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Sample {
    pub position: LngLat,
    pub bearing: f64,
    pub phase: TripPhase,
    pub progress: f64,
}

impl FrameState {
    pub fn new(trip: &CompiledTrip) -> Self {
        Self {
            current_position: trip.start_point(),
            current_bearing: trip.first_segment_bearing,
            current_phase: TripPhase::Hidden,
            current_phase_progress: 0.0,
            is_visible: false,
            is_selected: false,
            last_segment_index: 0,
        }
    }

    /// `None` while hidden.
    pub fn sample(&self) -> Option<Sample> {
        self.is_visible.then_some(Sample {
            position: self.current_position,
            bearing: self.current_bearing,
            phase: self.current_phase,
            progress: self.current_phase_progress,
        })
    }

    fn hold(&mut self, position: LngLat, bearing: f64, phase: TripPhase, progress: f64) {
        self.current_position = position;
        self.current_bearing = bearing;
        self.current_phase = phase;
        self.current_phase_progress = progress;
        self.is_visible = true;
    }
}

/// Update `state` for simulated time `t` (seconds since window start).
pub fn interpolate(trip: &CompiledTrip, state: &mut FrameState, t: f64) {
    if t < trip.visible_start_seconds || t > trip.visible_end_seconds {
        state.is_visible = false;
        state.current_phase = TripPhase::Hidden;
        state.current_phase_progress = 0.0;
        return;
    }

    if t < trip.fade_in_end_seconds {
        let progress = trip.fade_in_span().progress(Time(t));
        state.hold(
            trip.start_point(),
            trip.first_segment_bearing,
            TripPhase::FadingIn,
            progress,
        );
        return;
    }

    if t > trip.end_time_seconds {
        let progress = trip.fade_out_span().progress(Time(t));
        state.hold(
            trip.end_point(),
            trip.last_segment_bearing,
            TripPhase::FadingOut,
            progress,
        );
        return;
    }

    let i = locate_segment(&trip.timestamps, t, state.last_segment_index);
    state.last_segment_index = i;

    let t0 = trip.timestamps[i];
    let t1 = trip.timestamps[i + 1];
    let f = if t1 > t0 {
        ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let position = lerp_lnglat(trip.path[i], trip.path[i + 1], f);
    let here = trip.segment_bearings[i];
    let next = trip.segment_bearings.get(i + 1).copied().unwrap_or(here);
    let bearing = lerp_bearing(here, next, f);
    let progress = trip.moving_span().progress(Time(t));

    state.hold(position, bearing, TripPhase::Moving, progress);
}

/// Index `i` of the segment `[timestamps[i], timestamps[i + 1]]` bracketing `t`.
///
/// Always the largest `i <= len - 2` with `timestamps[i] <= t` (0 if none),
/// regardless of `hint`. Forward playback resolves in a few steps from the
/// hint; backward jumps and long skips use binary search.
pub fn locate_segment(timestamps: &[f64], t: f64, hint: usize) -> usize {
    let last = timestamps.len().saturating_sub(2);
    let mut i = hint.min(last);

    if timestamps[i] <= t {
        let mut steps = 0;
        while i < last && timestamps[i + 1] <= t {
            i += 1;
            steps += 1;
            if steps > MAX_FORWARD_SCAN {
                return binary_locate(timestamps, t, last);
            }
        }
        return i;
    }

    binary_locate(timestamps, t, last)
}

fn binary_locate(timestamps: &[f64], t: f64, last: usize) -> usize {
    timestamps
        .partition_point(|&ts| ts <= t)
        .saturating_sub(1)
        .min(last)
}

#[cfg(test)]
mod tests {
    use super::{FrameState, TripPhase, interpolate, locate_segment};
    use crate::trip::{BikeType, CompiledTrip, RiderCategory};
    use foundation::ids::TripId;
    use foundation::math::LngLat;

    /// Straight east-then-north route: 100s..160s, fade 5s.
    fn scenario_trip() -> CompiledTrip {
        CompiledTrip {
            id: TripId::new("t1"),
            bike_type: BikeType::ClassicBike,
            rider_category: RiderCategory::Member,
            path: vec![
                LngLat::new(0.0, 0.0),
                LngLat::new(0.001, 0.0),
                LngLat::new(0.002, 0.0),
                LngLat::new(0.002, 0.001),
            ],
            timestamps: vec![100.0, 120.0, 140.0, 160.0],
            cumulative_distances: vec![0.0, 111.0, 222.0, 333.0],
            segment_bearings: vec![90.0, 90.0, 0.0],
            visible_start_seconds: 95.0,
            start_time_seconds: 100.0,
            fade_in_end_seconds: 100.0,
            end_time_seconds: 160.0,
            visible_end_seconds: 165.0,
            first_segment_bearing: 90.0,
            last_segment_bearing: 0.0,
        }
    }

    fn run(trip: &CompiledTrip, ts: &[f64]) -> FrameState {
        let mut state = FrameState::new(trip);
        for &t in ts {
            interpolate(trip, &mut state, t);
        }
        state
    }

    #[test]
    fn phases_follow_the_visible_window() {
        let trip = scenario_trip();

        let s = run(&trip, &[90.0]);
        assert!(!s.is_visible);
        assert_eq!(s.current_phase, TripPhase::Hidden);

        let s = run(&trip, &[97.0]);
        assert_eq!(s.current_phase, TripPhase::FadingIn);
        assert_eq!(s.current_bearing, trip.first_segment_bearing);
        assert_eq!(s.current_position, trip.start_point());
        assert!((s.current_phase_progress - 0.4).abs() < 1e-9);

        // Fade-in ends at the trip start; two seconds in the bike is moving.
        let s = run(&trip, &[102.0]);
        assert_eq!(s.current_phase, TripPhase::Moving);
        assert_eq!(s.current_bearing, trip.first_segment_bearing);

        let s = run(&trip, &[130.0]);
        assert_eq!(s.current_phase, TripPhase::Moving);
        assert!((s.current_position.lng - 0.0015).abs() < 1e-12);
        assert!((s.current_phase_progress - 0.5).abs() < 1e-9);

        let s = run(&trip, &[163.0]);
        assert_eq!(s.current_phase, TripPhase::FadingOut);
        assert_eq!(s.current_position, trip.end_point());
        assert_eq!(s.current_bearing, trip.last_segment_bearing);

        let s = run(&trip, &[166.0]);
        assert!(!s.is_visible);
        assert!(s.sample().is_none());
    }

    #[test]
    fn trip_endpoints_belong_to_moving_phase() {
        let trip = scenario_trip();
        let s = run(&trip, &[100.0]);
        assert_eq!(s.current_phase, TripPhase::Moving);
        assert_eq!(s.current_position, trip.start_point());

        let s = run(&trip, &[160.0]);
        assert_eq!(s.current_phase, TripPhase::Moving);
        assert_eq!(s.current_position, trip.end_point());
    }

    #[test]
    fn hidden_frames_leave_cursor_alone() {
        let trip = scenario_trip();
        let mut state = FrameState::new(&trip);
        interpolate(&trip, &mut state, 150.0);
        assert_eq!(state.last_segment_index, 2);
        interpolate(&trip, &mut state, 500.0);
        assert_eq!(state.last_segment_index, 2);
    }

    #[test]
    fn bearing_turns_through_the_corner() {
        let trip = scenario_trip();
        let s = run(&trip, &[130.0]);
        // Halfway along the second segment, blending east toward north.
        assert!((s.current_bearing - 45.0).abs() < 1e-9);
    }

    #[test]
    fn increasing_sequence_matches_single_call() {
        let trip = scenario_trip();
        let steps: Vec<f64> = (0..=70).map(|i| 96.0 + i as f64).collect();
        for (n, &t) in steps.iter().enumerate() {
            let walked = run(&trip, &steps[..=n]);
            let direct = run(&trip, &[t]);
            assert_eq!(walked.sample(), direct.sample(), "t={t}");
        }
    }

    #[test]
    fn backward_seek_reproduces_forward_positions() {
        let trip = scenario_trip();
        let mut state = FrameState::new(&trip);
        let forward: Vec<_> = (100..=160)
            .map(|t| {
                interpolate(&trip, &mut state, t as f64);
                state.sample()
            })
            .collect();

        interpolate(&trip, &mut state, 158.0);
        let replayed: Vec<_> = (100..=160)
            .map(|t| {
                interpolate(&trip, &mut state, t as f64);
                state.sample()
            })
            .collect();
        assert_eq!(forward, replayed);
    }

    #[test]
    fn locate_is_hint_independent() {
        let ts = [0.0, 10.0, 10.0, 20.0, 30.0, 30.0, 40.0];
        for t in [0.0, 5.0, 10.0, 15.0, 30.0, 35.0, 40.0] {
            let expected = locate_segment(&ts, t, 0);
            for hint in 0..10 {
                assert_eq!(locate_segment(&ts, t, hint), expected, "t={t} hint={hint}");
            }
        }
        assert_eq!(locate_segment(&ts, 10.0, 0), 2);
        assert_eq!(locate_segment(&ts, 40.0, 0), 5);
    }

    #[test]
    fn long_forward_skip_uses_binary_search() {
        let ts: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(locate_segment(&ts, 87.5, 0), 87);
        assert_eq!(locate_segment(&ts, 2.5, 87), 2);
    }
}
