use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use foundation::ids::{BatchId, ChunkIndex};
use foundation::time::TimeSpan;
use scene::trip::CompiledTrip;

/// Compiled trips keyed by batch, owned by the worker.
///
/// Notes:
/// - Batches are keyed in a `BTreeMap` for stable traversal order.
/// - Removing a batch only drops the store's references; chunks already
///   handed out keep their trips alive.
#[derive(Debug, Default)]
pub struct BatchStore {
    batches: BTreeMap<BatchId, Vec<Arc<CompiledTrip>>>,
}

impl BatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever `batch` held. Returns the previous trip count.
    pub fn insert(&mut self, batch: BatchId, trips: Vec<Arc<CompiledTrip>>) -> Option<usize> {
        self.batches.insert(batch, trips).map(|old| old.len())
    }

    pub fn remove(&mut self, batch: BatchId) -> bool {
        self.batches.remove(&batch).is_some()
    }

    pub fn contains(&self, batch: BatchId) -> bool {
        self.batches.contains_key(&batch)
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    pub fn trip_count(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    /// Trips relevant to `chunk`, whose interval is `window`.
    ///
    /// `None` when the chunk's own batch is not loaded. Loaded neighbours
    /// contribute too: trips of the previous batch still visible in the
    /// window, and trips of the next batch already fading in. The result holds
    /// each id once, own batch first.
    pub fn chunk(
        &self,
        chunk: ChunkIndex,
        window: &TimeSpan,
        chunks_per_batch: u64,
    ) -> Option<Vec<Arc<CompiledTrip>>> {
        let batch = chunk.batch(chunks_per_batch);
        let own = self.batches.get(&batch)?;
        let mut seen = HashSet::new();
        let trips = own
            .iter()
            .chain(self.trips_of(batch.prev()))
            .chain(self.trips_of(Some(batch.next())))
            .filter(|trip| trip.visible_span().overlaps_window(window))
            .filter(|trip| seen.insert(trip.id.clone()))
            .cloned()
            .collect();
        Some(trips)
    }

    fn trips_of(&self, batch: Option<BatchId>) -> impl Iterator<Item = &Arc<CompiledTrip>> {
        batch
            .and_then(|b| self.batches.get(&b))
            .into_iter()
            .flatten()
    }
}
