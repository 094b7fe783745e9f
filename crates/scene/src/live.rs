use std::collections::BTreeMap;
use std::sync::Arc;

use foundation::ids::TripId;
use foundation::math::LngLat;
use serde::Serialize;

use crate::interpolate::{FrameState, TripPhase, interpolate};
use crate::trip::{BikeType, CompiledTrip, RiderCategory};

/// One positioned record handed to the renderer per frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRecord {
    pub id: TripId,
    pub position: LngLat,
    pub bearing: f64,
    pub phase: TripPhase,
    pub progress: f64,
    pub bike_type: BikeType,
    pub rider_category: RiderCategory,
    pub selected: bool,
}

#[derive(Debug)]
struct LiveTrip {
    trip: Arc<CompiledTrip>,
    state: FrameState,
}

/// The trips relevant to the current chunk, each with its frame state.
///
/// Ordering contract:
/// - `records` yields visible trips in ascending `TripId` order.
#[derive(Debug, Default)]
pub struct LiveTrips {
    trips: BTreeMap<TripId, LiveTrip>,
    selected: Option<TripId>,
    visible: usize,
}

impl LiveTrips {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    /// Visible trips as of the last `update`.
    pub fn visible_count(&self) -> usize {
        self.visible
    }

    pub fn clear(&mut self) {
        self.trips.clear();
        self.visible = 0;
    }

    /// Swap in a new chunk's trips.
    ///
    /// Trips already live keep their frame state (cursor, selection) so a
    /// chunk boundary is invisible to the animation.
    pub fn replace_with(&mut self, trips: impl IntoIterator<Item = Arc<CompiledTrip>>) {
        let mut previous = std::mem::take(&mut self.trips);
        for trip in trips {
            let state = match previous.remove(&trip.id) {
                Some(old) => old.state,
                None => {
                    let mut state = FrameState::new(&trip);
                    state.is_selected = self.selected.as_ref() == Some(&trip.id);
                    state
                }
            };
            self.trips.insert(trip.id.clone(), LiveTrip { trip, state });
        }
        self.visible = self.trips.values().filter(|t| t.state.is_visible).count();
    }

    /// Run the interpolator for every live trip at `t` (seconds since window start).
    pub fn update(&mut self, t: f64) -> usize {
        let mut visible = 0;
        for live in self.trips.values_mut() {
            interpolate(&live.trip, &mut live.state, t);
            if live.state.is_visible {
                visible += 1;
            }
        }
        self.visible = visible;
        visible
    }

    pub fn records(&self) -> Vec<RenderRecord> {
        self.trips
            .values()
            .filter_map(|live| {
                let sample = live.state.sample()?;
                Some(RenderRecord {
                    id: live.trip.id.clone(),
                    position: sample.position,
                    bearing: sample.bearing,
                    phase: sample.phase,
                    progress: sample.progress,
                    bike_type: live.trip.bike_type,
                    rider_category: live.trip.rider_category,
                    selected: live.state.is_selected,
                })
            })
            .collect()
    }

    pub fn get(&self, id: &TripId) -> Option<(&CompiledTrip, &FrameState)> {
        self.trips.get(id).map(|live| (live.trip.as_ref(), &live.state))
    }

    /// Mark `id` as selected. The selection survives chunk swaps even if the
    /// trip is not live right now. Returns whether the trip is currently live.
    ///
    /// Only `is_selected` is written here; the interpolated fields stay as the
    /// last frame left them.
    pub fn select(&mut self, id: &TripId) -> bool {
        self.clear_selection();
        self.selected = Some(id.clone());
        match self.trips.get_mut(id) {
            Some(live) => {
                live.state.is_selected = true;
                true
            }
            None => false,
        }
    }

    pub fn clear_selection(&mut self) {
        if let Some(prev) = self.selected.take()
            && let Some(live) = self.trips.get_mut(&prev)
        {
            live.state.is_selected = false;
        }
    }

    pub fn selected(&self) -> Option<&TripId> {
        self.selected.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::LiveTrips;
    use crate::interpolate::TripPhase;
    use crate::trip::{BikeType, CompiledTrip, RiderCategory};
    use foundation::ids::TripId;
    use foundation::math::LngLat;
    use std::sync::Arc;

    fn trip(id: &str, start: f64, end: f64) -> Arc<CompiledTrip> {
        Arc::new(CompiledTrip {
            id: TripId::new(id),
            bike_type: BikeType::ElectricBike,
            rider_category: RiderCategory::Casual,
            path: vec![LngLat::new(0.0, 0.0), LngLat::new(0.01, 0.0)],
            timestamps: vec![start, end],
            cumulative_distances: vec![0.0, 1112.0],
            segment_bearings: vec![90.0],
            visible_start_seconds: start - 10.0,
            start_time_seconds: start,
            fade_in_end_seconds: start,
            end_time_seconds: end,
            visible_end_seconds: end + 10.0,
            first_segment_bearing: 90.0,
            last_segment_bearing: 90.0,
        })
    }

    #[test]
    fn records_only_visible_trips_in_id_order() {
        let mut live = LiveTrips::new();
        live.replace_with([trip("b", 0.0, 100.0), trip("a", 50.0, 60.0), trip("c", 500.0, 600.0)]);
        assert_eq!(live.len(), 3);

        assert_eq!(live.update(55.0), 2);
        let records = live.records();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(records[0].phase, TripPhase::Moving);
        assert_eq!(records[0].bike_type, BikeType::ElectricBike);
    }

    #[test]
    fn chunk_swap_keeps_state_of_surviving_trips() {
        let mut live = LiveTrips::new();
        live.replace_with([trip("a", 0.0, 100.0)]);
        live.select(&TripId::new("a"));
        live.update(40.0);

        live.replace_with([trip("a", 0.0, 100.0), trip("b", 60.0, 90.0)]);
        let (_, state) = live.get(&TripId::new("a")).unwrap();
        assert!(state.is_selected);
        assert!(state.is_visible);
        assert_eq!(live.visible_count(), 1);

        let (_, state) = live.get(&TripId::new("b")).unwrap();
        assert!(!state.is_visible);
    }

    #[test]
    fn selecting_touches_only_the_selected_flag() {
        let mut live = LiveTrips::new();
        live.replace_with([trip("a", 0.0, 100.0)]);
        live.update(40.0);
        let (_, before) = live.get(&TripId::new("a")).unwrap();
        let before = before.clone();

        assert!(live.select(&TripId::new("a")));
        let (_, after) = live.get(&TripId::new("a")).unwrap();
        assert!(after.is_selected);
        assert_eq!(
            after.clone(),
            crate::interpolate::FrameState {
                is_selected: true,
                ..before
            }
        );
    }

    #[test]
    fn selection_applies_to_trips_arriving_later() {
        let mut live = LiveTrips::new();
        assert!(!live.select(&TripId::new("z")));
        live.replace_with([trip("z", 0.0, 10.0)]);
        live.update(5.0);
        assert!(live.records()[0].selected);

        live.clear_selection();
        assert!(!live.records()[0].selected);
        assert_eq!(live.selected(), None);
    }
}
