use std::collections::BTreeMap;

use foundation::ids::BatchId;

/// Lifecycle of one batch as seen from the playback side.
///
/// Requested → Fetching → Compiling → Resident → Evicted, or Failed from
/// Fetching/Compiling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResidencyState {
    /// A chunk of this batch was asked for; the worker has not answered yet.
    Requested,
    Fetching,
    Compiling,
    Resident,
    Evicted,
    Failed,
}

impl ResidencyState {
    /// Work for the batch is under way and must not be started again.
    pub fn is_pending(self) -> bool {
        matches!(self, ResidencyState::Fetching | ResidencyState::Compiling)
    }
}

#[derive(Debug, Default)]
pub struct ResidencyTable {
    states: BTreeMap<BatchId, ResidencyState>,
}

impl ResidencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, batch: BatchId) -> Option<ResidencyState> {
        self.states.get(&batch).copied()
    }

    pub fn set(&mut self, batch: BatchId, state: ResidencyState) {
        self.states.insert(batch, state);
    }

    pub fn remove(&mut self, batch: BatchId) -> Option<ResidencyState> {
        self.states.remove(&batch)
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn is_pending(&self, batch: BatchId) -> bool {
        self.state(batch).is_some_and(ResidencyState::is_pending)
    }

    pub fn in_state(&self, state: ResidencyState) -> Vec<BatchId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(b, _)| *b)
            .collect()
    }

    pub fn resident(&self) -> Vec<BatchId> {
        self.in_state(ResidencyState::Resident)
    }

    /// Tracked batches outside `[lo, hi]` that are not already evicted.
    pub fn outside(&self, lo: u64, hi: u64) -> Vec<BatchId> {
        self.states
            .iter()
            .filter(|(b, s)| (b.0 < lo || b.0 > hi) && **s != ResidencyState::Evicted)
            .map(|(b, _)| *b)
            .collect()
    }
}
