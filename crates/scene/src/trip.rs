use chrono::{DateTime, Utc};
use foundation::ids::TripId;
use foundation::math::LngLat;
use foundation::time::TimeSpan;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BikeType {
    ClassicBike,
    ElectricBike,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiderCategory {
    Member,
    Casual,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One historical ride, exactly as the store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrip {
    pub id: TripId,
    pub start_station_id: String,
    pub end_station_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub bike_type: BikeType,
    #[serde(default)]
    pub rider_category: RiderCategory,
    pub start_lat: f64,
    pub start_lng: f64,
    #[serde(default)]
    pub end_lat: Option<f64>,
    #[serde(default)]
    pub end_lng: Option<f64>,
    /// Encoded polyline of the routed path, if the store has one.
    #[serde(default)]
    pub route_geometry: Option<String>,
    #[serde(default)]
    pub route_distance_m: Option<f64>,
}

impl RawTrip {
    pub fn start(&self) -> LngLat {
        LngLat::new(self.start_lng, self.start_lat)
    }

    pub fn end(&self) -> Option<LngLat> {
        match (self.end_lng, self.end_lat) {
            (Some(lng), Some(lat)) => Some(LngLat::new(lng, lat)),
            _ => None,
        }
    }

    /// Same start and end station; such rows are not animated.
    pub fn is_zero_length(&self) -> bool {
        self.start_station_id == self.end_station_id
    }
}

/// Animation-ready projection of a [`RawTrip`].
///
/// Produced once by the compiler and then only shared (`Arc`) and read.
/// Per-frame state lives in [`FrameState`](crate::FrameState).
///
/// Times are simulated seconds from the window start. Ordering contract:
/// `visible_start_seconds <= start_time_seconds == fade_in_end_seconds
///  <= end_time_seconds <= visible_end_seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTrip {
    pub id: TripId,
    pub bike_type: BikeType,
    pub rider_category: RiderCategory,

    /// At least two points.
    pub path: Vec<LngLat>,
    /// One per path point, non-decreasing.
    pub timestamps: Vec<f64>,
    /// One per path point, meters from the route start, non-decreasing.
    pub cumulative_distances: Vec<f64>,
    /// One per segment (`path.len() - 1`), degrees clockwise from north.
    pub segment_bearings: Vec<f64>,

    pub visible_start_seconds: f64,
    pub start_time_seconds: f64,
    pub fade_in_end_seconds: f64,
    pub end_time_seconds: f64,
    pub visible_end_seconds: f64,

    pub first_segment_bearing: f64,
    pub last_segment_bearing: f64,
}

impl CompiledTrip {
    pub fn visible_span(&self) -> TimeSpan {
        TimeSpan::new(self.visible_start_seconds, self.visible_end_seconds)
    }

    pub fn fade_in_span(&self) -> TimeSpan {
        TimeSpan::new(self.visible_start_seconds, self.fade_in_end_seconds)
    }

    pub fn moving_span(&self) -> TimeSpan {
        TimeSpan::new(self.fade_in_end_seconds, self.end_time_seconds)
    }

    pub fn fade_out_span(&self) -> TimeSpan {
        TimeSpan::new(self.end_time_seconds, self.visible_end_seconds)
    }

    pub fn start_point(&self) -> LngLat {
        self.path[0]
    }

    pub fn end_point(&self) -> LngLat {
        self.path[self.path.len() - 1]
    }

    pub fn route_distance_meters(&self) -> f64 {
        self.cumulative_distances.last().copied().unwrap_or(0.0)
    }
}
