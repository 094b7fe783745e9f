//! Where raw trip rows come from.
//!
//! The store only has to answer two range queries: rows whose start falls in
//! `[from, to)`, and rows in progress at an instant. Everything else (batch
//! arithmetic, dedupe, single-flight) lives in [`crate::fetch`].

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use scene::trip::RawTrip;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A failed source query.
///
/// `Clone` so one failure can be handed to every caller waiting on the same
/// fetch.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub message: String,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }
}

/// Range-queryable trip store.
///
/// Implementations must be `Send + Sync`; fetches run as tokio tasks.
pub trait TripSource: Send + Sync {
    fn name(&self) -> &str;

    /// Rows with `from <= started_at < to`.
    fn trips_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<RawTrip>, FetchError>>;

    /// Rows with `started_at < at < ended_at`.
    fn trips_in_progress_at(
        &self,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<RawTrip>, FetchError>>;
}

/// Rows held in memory, e.g. a pre-exported day of trips.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    trips: Vec<RawTrip>,
}

impl MemorySource {
    pub fn new(trips: Vec<RawTrip>) -> Self {
        Self { trips }
    }

    /// Load a JSON array of trip rows.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FetchError::with_source(format!("read {}", path.display()), e))?;
        let trips: Vec<RawTrip> = serde_json::from_str(&text)
            .map_err(|e| FetchError::with_source(format!("parse {}", path.display()), e))?;
        Ok(Self::new(trips))
    }

    pub fn len(&self) -> usize {
        self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }
}

impl TripSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn trips_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<RawTrip>, FetchError>> {
        let rows = self
            .trips
            .iter()
            .filter(|t| t.started_at >= from && t.started_at < to)
            .cloned()
            .collect();
        Box::pin(async move { Ok(rows) })
    }

    fn trips_in_progress_at(
        &self,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<RawTrip>, FetchError>> {
        let rows = self
            .trips
            .iter()
            .filter(|t| t.started_at < at && t.ended_at > at)
            .cloned()
            .collect();
        Box::pin(async move { Ok(rows) })
    }
}

/// Trip store behind an HTTP API returning JSON arrays of rows.
///
/// `GET {base}/trips?from=..&to=..` and `GET {base}/trips/in-progress?at=..`,
/// timestamps in RFC 3339.
pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_rows(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<RawTrip>, FetchError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::with_source("HTTP request failed", e))?;

        if !resp.status().is_success() {
            return Err(FetchError::new(format!("HTTP error: {} ({url})", resp.status())));
        }

        resp.json::<Vec<RawTrip>>()
            .await
            .map_err(|e| FetchError::with_source("Failed to decode trip rows", e))
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl TripSource for HttpSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn trips_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<RawTrip>, FetchError>> {
        Box::pin(async move {
            self.get_rows("/trips", &[("from", rfc3339(from)), ("to", rfc3339(to))])
                .await
        })
    }

    fn trips_in_progress_at(
        &self,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<RawTrip>, FetchError>> {
        Box::pin(async move { self.get_rows("/trips/in-progress", &[("at", rfc3339(at))]).await })
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchError, HttpSource, MemorySource, TripSource, rfc3339};
    use chrono::{DateTime, Duration, Utc};
    use foundation::ids::TripId;
    use scene::trip::{BikeType, RawTrip, RiderCategory};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn row(id: &str, start: &str, minutes: i64) -> RawTrip {
        let started_at = at(start);
        RawTrip {
            id: TripId::new(id),
            start_station_id: "a".into(),
            end_station_id: "b".into(),
            started_at,
            ended_at: started_at + Duration::minutes(minutes),
            bike_type: BikeType::ClassicBike,
            rider_category: RiderCategory::Member,
            start_lat: 40.0,
            start_lng: -73.0,
            end_lat: Some(40.01),
            end_lng: Some(-73.0),
            route_geometry: None,
            route_distance_m: None,
        }
    }

    fn ids(rows: &[RawTrip]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn memory_source_answers_both_queries() {
        let source = MemorySource::new(vec![
            row("early", "2024-06-01T07:50:00Z", 20),
            row("edge", "2024-06-01T08:00:00Z", 5),
            row("inside", "2024-06-01T08:30:00Z", 5),
            row("next", "2024-06-01T09:00:00Z", 5),
        ]);
        let from = at("2024-06-01T08:00:00Z");
        let to = at("2024-06-01T09:00:00Z");

        let starting = source.trips_starting_between(from, to).await.unwrap();
        assert_eq!(ids(&starting), vec!["edge", "inside"]);

        let in_progress = source.trips_in_progress_at(from).await.unwrap();
        assert_eq!(ids(&in_progress), vec!["early"]);
    }

    #[tokio::test]
    async fn missing_file_is_a_fetch_error() {
        let err = MemorySource::from_json_file("/definitely/not/here.json")
            .await
            .unwrap_err();
        assert!(err.message.starts_with("read "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn fetch_error_display_includes_source() {
        let io = std::io::Error::other("boom");
        let err = FetchError::with_source("HTTP request failed", io);
        assert_eq!(err.to_string(), "HTTP request failed: boom");
        assert_eq!(FetchError::new("plain").to_string(), "plain");
    }

    #[test]
    fn http_source_normalizes_base_and_timestamps() {
        let source = HttpSource::new("http://localhost:8080/api/");
        assert_eq!(source.base_url(), "http://localhost:8080/api");
        assert_eq!(rfc3339(at("2024-06-01T08:00:00Z")), "2024-06-01T08:00:00.000Z");
    }
}
