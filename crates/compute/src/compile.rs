//! Trip geometry/phase compiler.
//!
//! Turns one [`RawTrip`] into one [`CompiledTrip`]: decodes the route, lays
//! out cumulative distance, maps every path point to a simulated timestamp
//! (slower near the stations) and precomputes headings. Everything the
//! per-frame interpolator needs is computed here, once, off the render thread.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use foundation::math::{
    LngLat, POLYLINE_PRECISION, PolylineError, decode_polyline, haversine_distance,
    initial_bearing,
};
use scene::trip::{CompiledTrip, RawTrip};
use tracing::debug;

/// Parameters shared by every trip of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileParams {
    /// Simulated time origin.
    pub window_start: DateTime<Utc>,
    pub fade_duration_seconds: f64,
    /// Distance from either station over which the bike is slowed down.
    pub ease_distance_meters: f64,
    /// How much longer a meter takes inside an ease zone.
    pub ease_time_multiplier: f64,
}

impl CompileParams {
    pub fn new(window_start: DateTime<Utc>, fade_duration_seconds: f64) -> Self {
        Self {
            window_start,
            fade_duration_seconds,
            ease_distance_meters: 300.0,
            ease_time_multiplier: 2.0,
        }
    }

    /// Simulated seconds from the window start to `at`.
    pub fn seconds_since_window_start(&self, at: DateTime<Utc>) -> f64 {
        (at - self.window_start).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// No route and no end coordinates to draw a straight line to.
    MissingEndCoordinates,
    MalformedRoute(PolylineError),
    /// Route decoded to fewer than two points.
    DegenerateRoute { points: usize },
    NonFiniteCoordinate,
    NegativeDuration { seconds: f64 },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::MissingEndCoordinates => {
                write!(f, "no route geometry and no end coordinates")
            }
            CompileError::MalformedRoute(e) => write!(f, "malformed route geometry: {e}"),
            CompileError::DegenerateRoute { points } => {
                write!(f, "route has {points} point(s), need at least 2")
            }
            CompileError::NonFiniteCoordinate => write!(f, "route contains a non-finite coordinate"),
            CompileError::NegativeDuration { seconds } => {
                write!(f, "trip ends {seconds}s before it starts")
            }
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::MalformedRoute(e) => Some(e),
            _ => None,
        }
    }
}

pub fn compile(raw: &RawTrip, params: &CompileParams) -> Result<CompiledTrip, CompileError> {
    let start_time = params.seconds_since_window_start(raw.started_at);
    let end_time = params.seconds_since_window_start(raw.ended_at);
    if end_time < start_time {
        return Err(CompileError::NegativeDuration {
            seconds: start_time - end_time,
        });
    }

    let path = route_path(raw)?;
    if path.iter().any(|p| !p.is_finite()) {
        return Err(CompileError::NonFiniteCoordinate);
    }

    let cumulative_distances = cumulative_distances(&path);
    let timestamps = distribute_time(
        &cumulative_distances,
        start_time,
        end_time,
        params.ease_distance_meters,
        params.ease_time_multiplier,
    );
    let segment_bearings = segment_bearings(&path, &cumulative_distances);
    let first_segment_bearing = segment_bearings[0];
    let last_segment_bearing = segment_bearings[segment_bearings.len() - 1];

    let fade = params.fade_duration_seconds.max(0.0);
    Ok(CompiledTrip {
        id: raw.id.clone(),
        bike_type: raw.bike_type,
        rider_category: raw.rider_category,
        path,
        timestamps,
        cumulative_distances,
        segment_bearings,
        visible_start_seconds: start_time - fade,
        start_time_seconds: start_time,
        fade_in_end_seconds: start_time,
        end_time_seconds: end_time,
        visible_end_seconds: end_time + fade,
        first_segment_bearing,
        last_segment_bearing,
    })
}

fn route_path(raw: &RawTrip) -> Result<Vec<LngLat>, CompileError> {
    match raw.route_geometry.as_deref().filter(|s| !s.is_empty()) {
        Some(encoded) => {
            let path = decode_polyline(encoded, POLYLINE_PRECISION)
                .map_err(CompileError::MalformedRoute)?;
            if path.len() < 2 {
                return Err(CompileError::DegenerateRoute { points: path.len() });
            }
            Ok(path)
        }
        None => {
            let end = raw.end().ok_or(CompileError::MissingEndCoordinates)?;
            Ok(vec![raw.start(), end])
        }
    }
}

pub fn cumulative_distances(path: &[LngLat]) -> Vec<f64> {
    let mut out = Vec::with_capacity(path.len());
    let mut total = 0.0;
    out.push(total);
    for w in path.windows(2) {
        total += haversine_distance(w[0], w[1]);
        out.push(total);
    }
    out
}

/// Map cumulative distances to timestamps in `[start, end]`.
///
/// Meters within `ease_distance` of either end weigh `ease_multiplier`, every
/// other meter weighs 1; time is spread proportionally to accumulated weight.
/// Ease zones are capped at half the route so they never overlap. If the
/// route has no length, every fraction holds at the previous value and only
/// the final point lands on `end`.
pub fn distribute_time(
    cumulative: &[f64],
    start: f64,
    end: f64,
    ease_distance: f64,
    ease_multiplier: f64,
) -> Vec<f64> {
    let total = cumulative.last().copied().unwrap_or(0.0);
    let ease = ease_distance.max(0.0).min(total / 2.0);
    let extra = ease_multiplier.max(1.0) - 1.0;
    let tail_start = total - ease;

    let weight = |d: f64| d + extra * (d.min(ease) + (d - tail_start).max(0.0));
    let total_weight = weight(total);
    let duration = end - start;

    let mut prev = 0.0;
    let mut out: Vec<f64> = cumulative
        .iter()
        .map(|&d| {
            let frac = weight(d) / total_weight;
            if total_weight > 0.0 && frac.is_finite() {
                prev = frac.clamp(prev, 1.0);
            }
            start + duration * prev
        })
        .collect();

    if let Some(last) = out.last_mut() {
        *last = end;
    }
    out
}

/// One heading per segment. Zero-length segments take the heading of the
/// previous real segment (or the next one, at the start of the route).
pub fn segment_bearings(path: &[LngLat], cumulative: &[f64]) -> Vec<f64> {
    let raw: Vec<Option<f64>> = path
        .windows(2)
        .zip(cumulative.windows(2))
        .map(|(p, d)| (d[1] > d[0]).then(|| initial_bearing(p[0], p[1])))
        .collect();

    let first_valid = raw.iter().flatten().next().copied().unwrap_or(0.0);
    let mut current = first_valid;
    raw.into_iter()
        .map(|b| {
            if let Some(b) = b {
                current = b;
            }
            current
        })
        .collect()
}

/// Compiled trips of one batch plus how many rows were unusable.
#[derive(Debug, Clone, Default)]
pub struct CompiledBatch {
    pub trips: Vec<Arc<CompiledTrip>>,
    pub dropped: usize,
}

/// Compile every row; failures drop the trip, never the batch.
///
/// Duplicate ids keep the first compiled copy.
pub fn compile_batch(raws: &[RawTrip], params: &CompileParams) -> CompiledBatch {
    #[cfg(feature = "parallel")]
    let results: Vec<Result<CompiledTrip, CompileError>> = {
        use rayon::prelude::*;
        raws.par_iter().map(|raw| compile(raw, params)).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let results: Vec<Result<CompiledTrip, CompileError>> =
        raws.iter().map(|raw| compile(raw, params)).collect();

    let mut seen = HashSet::with_capacity(results.len());
    let mut batch = CompiledBatch::default();
    for (raw, result) in raws.iter().zip(results) {
        match result {
            Ok(trip) => {
                if seen.insert(trip.id.clone()) {
                    batch.trips.push(Arc::new(trip));
                } else {
                    debug!(trip = %raw.id, "duplicate trip id in batch, keeping first");
                }
            }
            Err(err) => {
                debug!(trip = %raw.id, error = %err, "dropping uncompilable trip");
                batch.dropped += 1;
            }
        }
    }
    batch
}
