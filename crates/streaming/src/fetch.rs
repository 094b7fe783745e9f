use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use foundation::ids::{BatchId, TripId};
use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;
use scene::trip::RawTrip;
use tracing::debug;

use crate::source::{BoxFuture, FetchError, TripSource};

pub type BatchRows = Arc<Vec<RawTrip>>;

/// A fetch every caller for the same batch awaits together.
pub type SharedFetch = Shared<BoxFuture<'static, Result<BatchRows, FetchError>>>;

/// Turns batch ids into source queries for one window.
///
/// Concurrent fetches of one batch share a single source query. The entry is
/// dropped once the query settles, so a later call after a failure starts a
/// fresh query.
pub struct BatchFetcher {
    source: Arc<dyn TripSource>,
    window_start: DateTime<Utc>,
    batch_duration_secs: u64,
    inflight: Arc<Mutex<HashMap<BatchId, SharedFetch>>>,
}

impl BatchFetcher {
    pub fn new(
        source: Arc<dyn TripSource>,
        window_start: DateTime<Utc>,
        batch_duration_secs: u64,
    ) -> Self {
        Self {
            source,
            window_start,
            batch_duration_secs,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// `[from, to)` covered by `batch`.
    pub fn batch_window(&self, batch: BatchId) -> (DateTime<Utc>, DateTime<Utc>) {
        let secs = i64::try_from(self.batch_duration_secs).unwrap_or(i64::MAX);
        let from = i64::try_from(batch.0)
            .ok()
            .and_then(|b| b.checked_mul(secs))
            .and_then(Duration::try_seconds)
            .and_then(|offset| self.window_start.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let to = Duration::try_seconds(secs)
            .and_then(|d| from.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (from, to)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Fetch the raw rows of `batch`.
    ///
    /// The lookup happens when this is called, not when the future is first
    /// polled, so callers that ask before the first one settles always join it.
    pub fn fetch_batch(&self, batch: BatchId) -> SharedFetch {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&batch) {
            debug!(batch = batch.0, "joining in-flight fetch");
            return existing.clone();
        }

        let source = Arc::clone(&self.source);
        let registry = Arc::clone(&self.inflight);
        let window_start = self.window_start;
        let (from, to) = self.batch_window(batch);

        let fut: BoxFuture<'static, Result<BatchRows, FetchError>> = async move {
            let result = query_batch(source.as_ref(), batch, from, to, window_start).await;
            registry.lock().remove(&batch);
            result.map(Arc::new)
        }
        .boxed();
        let shared = fut.shared();
        inflight.insert(batch, shared.clone());
        shared
    }
}

async fn query_batch(
    source: &dyn TripSource,
    batch: BatchId,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    window_start: DateTime<Utc>,
) -> Result<Vec<RawTrip>, FetchError> {
    let mut rows = source.trips_starting_between(from, to).await?;

    if batch == BatchId(0) {
        let in_progress = source.trips_in_progress_at(window_start).await?;
        rows = merge_by_id(rows, in_progress);
    }

    let fetched = rows.len();
    rows.retain(|r| !r.is_zero_length());
    debug!(
        batch = batch.0,
        source = source.name(),
        rows = rows.len(),
        zero_length = fetched - rows.len(),
        "batch fetched"
    );
    Ok(rows)
}

/// Union of two row sets by id. `primary` wins on collision, and duplicates
/// within either set keep their first occurrence.
pub fn merge_by_id(primary: Vec<RawTrip>, extra: Vec<RawTrip>) -> Vec<RawTrip> {
    let mut seen: HashSet<TripId> = HashSet::with_capacity(primary.len() + extra.len());
    primary
        .into_iter()
        .chain(extra)
        .filter(|row| seen.insert(row.id.clone()))
        .collect()
}
