use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use foundation::ids::{BatchId, ChunkIndex, TripId};
use runtime::clock::VirtualClock;
use runtime::frame::Frame;
use runtime::scheduler::Tick;
use scene::live::{LiveTrips, RenderRecord};
use scene::trip::CompiledTrip;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PlaybackConfig};
use crate::fetch::{BatchFetcher, BatchRows};
use crate::protocol::{InitParams, ProtocolError, RequestKind, WorkerRequest, WorkerResponse};
use crate::residency::{ResidencyState, ResidencyTable};
use crate::source::{FetchError, TripSource};
use crate::worker::{WorkerHandle, spawn_worker};

#[derive(Debug)]
pub enum PlaybackError {
    Config(ConfigError),
    Protocol(ProtocolError),
    Spawn(std::io::Error),
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::Config(e) => write!(f, "{e}"),
            PlaybackError::Protocol(e) => write!(f, "{e}"),
            PlaybackError::Spawn(e) => write!(f, "failed to start compiler thread: {e}"),
        }
    }
}

impl std::error::Error for PlaybackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlaybackError::Config(e) => Some(e),
            PlaybackError::Protocol(e) => Some(e),
            PlaybackError::Spawn(e) => Some(e),
        }
    }
}

impl From<ConfigError> for PlaybackError {
    fn from(e: ConfigError) -> Self {
        PlaybackError::Config(e)
    }
}

impl From<ProtocolError> for PlaybackError {
    fn from(e: ProtocolError) -> Self {
        PlaybackError::Protocol(e)
    }
}

impl From<std::io::Error> for PlaybackError {
    fn from(e: std::io::Error) -> Self {
        PlaybackError::Spawn(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub generation: u64,
    pub sim_time_seconds: f64,
    pub playing: bool,
    pub speed: f64,
    pub current_chunk: ChunkIndex,
    /// The current chunk has not reached the live set yet.
    pub loading: bool,
    pub live_trips: usize,
    pub visible_trips: usize,
    pub resident_batches: Vec<BatchId>,
    pub failed_batches: Vec<BatchId>,
}

struct FetchOutcome {
    generation: u64,
    batch: BatchId,
    result: Result<BatchRows, FetchError>,
}

/// Drives one playback session: clock, fetches, compiler worker, live set.
///
/// Everything here runs on the caller's thread inside [`Playback::tick`];
/// fetches run as tasks on the given tokio runtime and compilation on the
/// worker thread, and their results are picked up on later ticks.
///
/// Window generation: every [`Playback::seek`] bumps it. Fetch results and
/// worker responses from an older generation are dropped when consumed.
pub struct Playback {
    config: PlaybackConfig,
    source: Arc<dyn TripSource>,
    runtime: Handle,
    clock: VirtualClock,
    worker: WorkerHandle,
    fetcher: Arc<BatchFetcher>,
    generation: u64,
    /// The worker acknowledged `init` for the current generation.
    ready: bool,
    residency: ResidencyTable,
    /// Chunks asked of the worker (answered or not) within the live range.
    requested: BTreeSet<ChunkIndex>,
    chunks: BTreeMap<ChunkIndex, Vec<Arc<CompiledTrip>>>,
    live: LiveTrips,
    live_chunk: Option<ChunkIndex>,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    fetch_rx: mpsc::UnboundedReceiver<FetchOutcome>,
}

impl Playback {
    pub fn new(
        config: PlaybackConfig,
        source: Arc<dyn TripSource>,
        runtime: Handle,
    ) -> Result<Self, PlaybackError> {
        config.validate()?;
        let window_start = config.window_start()?;
        let worker = spawn_worker()?;
        let fetcher = Arc::new(BatchFetcher::new(
            Arc::clone(&source),
            window_start,
            config.batch_duration_secs,
        ));
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let playback = Self {
            clock: VirtualClock::new(config.speed_multiplier, config.max_frame_delta_ms),
            config,
            source,
            runtime,
            worker,
            fetcher,
            generation: 1,
            ready: false,
            residency: ResidencyTable::new(),
            requested: BTreeSet::new(),
            chunks: BTreeMap::new(),
            live: LiveTrips::new(),
            live_chunk: None,
            fetch_tx,
            fetch_rx,
        };
        playback.send_init()?;
        info!(
            source = playback.source.name(),
            %window_start,
            "playback started"
        );
        Ok(playback)
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn sim_seconds(&self) -> f64 {
        self.clock.time().0
    }

    pub fn residency(&self) -> &ResidencyTable {
        &self.residency
    }

    pub fn live(&self) -> &LiveTrips {
        &self.live
    }

    pub fn records(&self) -> Vec<RenderRecord> {
        self.live.records()
    }

    /// Advance one frame. Never blocks.
    pub fn tick(&mut self, real_delta_ms: f64) -> Frame {
        let frame = self.clock.tick(real_delta_ms);
        let t = frame.sim_seconds();

        self.drain_fetches();
        self.drain_responses();

        let chunk = self.config.chunk_at(t);
        if self.ready {
            self.ensure_chunks(chunk);
            self.ensure_previous_batch(chunk);
            self.prefetch(chunk, t);
            self.evict(chunk);
        }
        self.promote(chunk);
        self.live.update(t);
        frame
    }

    /// Jump to a new window. Everything loaded so far is dropped.
    pub fn seek(&mut self, window_start_ms: i64) -> Result<(), PlaybackError> {
        let config = PlaybackConfig {
            window_start_ms,
            ..self.config.clone()
        };
        let window_start = config.window_start()?;
        self.config = config;

        self.generation += 1;
        self.ready = false;
        self.clock.reset();
        self.residency.clear();
        self.requested.clear();
        self.chunks.clear();
        self.live.clear();
        self.live_chunk = None;
        self.fetcher = Arc::new(BatchFetcher::new(
            Arc::clone(&self.source),
            window_start,
            self.config.batch_duration_secs,
        ));
        self.send_init()?;
        info!(generation = self.generation, %window_start, "seek");
        Ok(())
    }

    pub fn scrub_to(&mut self, sim_seconds: f64) {
        self.clock.scrub_to(sim_seconds * 1000.0);
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.clock.set_speed(speed);
    }

    pub fn play(&mut self) {
        self.clock.play();
    }

    pub fn pause(&mut self) {
        self.clock.pause();
    }

    pub fn toggle(&mut self) {
        self.clock.toggle();
    }

    pub fn is_playing(&self) -> bool {
        self.clock.is_playing()
    }

    pub fn select(&mut self, id: &TripId) -> bool {
        self.live.select(id)
    }

    pub fn clear_selection(&mut self) {
        self.live.clear_selection();
    }

    /// Fetch failed batches again. Returns how many were restarted.
    pub fn retry_failed(&mut self) -> usize {
        let failed = self.residency.in_state(ResidencyState::Failed);
        for &batch in &failed {
            info!(batch = batch.0, "retrying batch");
            self.start_fetch(batch);
        }
        failed.len()
    }

    pub fn status(&self) -> PlaybackStatus {
        let t = self.sim_seconds();
        let current_chunk = self.config.chunk_at(t);
        PlaybackStatus {
            generation: self.generation,
            sim_time_seconds: t,
            playing: self.clock.is_playing(),
            speed: self.clock.speed(),
            current_chunk,
            loading: !self.ready || self.live_chunk != Some(current_chunk),
            live_trips: self.live.len(),
            visible_trips: self.live.visible_count(),
            resident_batches: self.residency.resident(),
            failed_batches: self.residency.in_state(ResidencyState::Failed),
        }
    }

    fn send_init(&self) -> Result<(), ProtocolError> {
        self.worker.send(WorkerRequest::Init(InitParams::from_config(
            &self.config,
            self.generation,
        )))
    }

    fn send(&mut self, request: WorkerRequest) {
        if let Err(err) = self.worker.send(request) {
            warn!(%err, "worker unavailable");
            self.ready = false;
        }
    }

    fn start_fetch(&mut self, batch: BatchId) {
        self.residency.set(batch, ResidencyState::Fetching);
        let fetch = self.fetcher.fetch_batch(batch);
        let tx = self.fetch_tx.clone();
        let generation = self.generation;
        self.runtime.spawn(async move {
            let result = fetch.await;
            // A closed channel means the playback is gone.
            let _ = tx.send(FetchOutcome {
                generation,
                batch,
                result,
            });
        });
        debug!(batch = batch.0, generation, "fetch started");
    }

    fn drain_fetches(&mut self) {
        while let Ok(outcome) = self.fetch_rx.try_recv() {
            let batch = outcome.batch;
            if outcome.generation != self.generation {
                debug!(batch = batch.0, generation = outcome.generation, "stale fetch dropped");
                continue;
            }
            if self.residency.state(batch) != Some(ResidencyState::Fetching) {
                debug!(batch = batch.0, "fetch no longer wanted");
                continue;
            }
            match outcome.result {
                Ok(rows) => {
                    self.residency.set(batch, ResidencyState::Compiling);
                    self.send(WorkerRequest::LoadBatch {
                        batch_id: batch,
                        raw_trips: rows,
                    });
                }
                Err(err) => {
                    warn!(batch = batch.0, %err, "batch fetch failed");
                    self.residency.set(batch, ResidencyState::Failed);
                }
            }
        }
    }

    fn drain_responses(&mut self) {
        while let Some(response) = self.worker.try_recv() {
            self.on_response(response);
        }
    }

    fn on_response(&mut self, response: WorkerResponse) {
        match response {
            WorkerResponse::Ready { generation } => {
                if generation == self.generation {
                    self.ready = true;
                    info!(generation, "compiler ready");
                } else {
                    debug!(generation, "stale ready dropped");
                }
            }
            _ if !self.ready => {
                debug!("response from a previous session dropped");
            }
            WorkerResponse::RequestBatch { batch_id } => self.request_batch(batch_id),
            WorkerResponse::BatchProcessed {
                batch_id,
                trip_count,
                dropped_count,
            } => {
                if self.residency.state(batch_id) != Some(ResidencyState::Compiling) {
                    debug!(batch = batch_id.0, "batch processed after eviction");
                    return;
                }
                self.residency.set(batch_id, ResidencyState::Resident);
                info!(
                    batch = batch_id.0,
                    trip_count, dropped_count, "batch resident"
                );
                self.rerequest_after_load(batch_id);
            }
            WorkerResponse::ChunkResponse { chunk_index, trips } => {
                if !self.requested.contains(&chunk_index) {
                    debug!(chunk = chunk_index.0, "chunk outside live range dropped");
                    return;
                }
                let batch = chunk_index.batch(self.config.chunks_per_batch());
                if self.residency.state(batch) == Some(ResidencyState::Requested) {
                    self.residency.set(batch, ResidencyState::Resident);
                }
                if self.live_chunk == Some(chunk_index) {
                    self.live_chunk = None;
                }
                self.chunks.insert(chunk_index, trips);
            }
            WorkerResponse::Error { message, context } => {
                warn!(%message, ?context, "worker error");
                if let Some(ctx) = context
                    && ctx.kind == RequestKind::LoadBatch
                    && let Some(batch) = ctx.batch_id
                {
                    self.residency.set(batch, ResidencyState::Failed);
                }
            }
        }
    }

    fn request_batch(&mut self, batch: BatchId) {
        match self.residency.state(batch) {
            Some(state) if state.is_pending() => {}
            Some(ResidencyState::Failed) => {
                debug!(batch = batch.0, "batch failed earlier; waiting for retry");
            }
            _ => self.start_fetch(batch),
        }
    }

    /// Ask again for chunks that were waiting on `batch`. Chunks of both
    /// neighbouring batches are refreshed too so they pick up trips crossing
    /// a boundary.
    fn rerequest_after_load(&mut self, batch: BatchId) {
        let per_batch = self.config.chunks_per_batch();
        let again: Vec<ChunkIndex> = self
            .requested
            .iter()
            .copied()
            .filter(|c| {
                let b = c.batch(per_batch);
                (b == batch && !self.chunks.contains_key(c))
                    || b == batch.next()
                    || Some(b) == batch.prev()
            })
            .collect();
        for chunk_index in again {
            self.send(WorkerRequest::RequestChunk { chunk_index });
        }
    }

    fn ensure_chunks(&mut self, chunk: ChunkIndex) {
        let per_batch = self.config.chunks_per_batch();
        for c in [chunk, chunk.next()] {
            if !self.requested.insert(c) {
                continue;
            }
            let batch = c.batch(per_batch);
            if self.residency.state(batch).is_none() {
                self.residency.set(batch, ResidencyState::Requested);
            }
            self.send(WorkerRequest::RequestChunk { chunk_index: c });
        }
    }

    /// Trips still on the road when a batch begins started in the batch
    /// before it, so that one has to be loaded as well.
    fn ensure_previous_batch(&mut self, chunk: ChunkIndex) {
        let Some(prev) = chunk.batch(self.config.chunks_per_batch()).prev() else {
            return;
        };
        match self.residency.state(prev) {
            None | Some(ResidencyState::Requested) | Some(ResidencyState::Evicted) => {
                debug!(batch = prev.0, "loading previous batch");
                self.start_fetch(prev);
            }
            _ => {}
        }
    }

    fn prefetch(&mut self, chunk: ChunkIndex, t: f64) {
        let batch = chunk.batch(self.config.chunks_per_batch());
        if self.config.batch_progress(batch, t) < self.config.prefetch_threshold {
            return;
        }
        for ahead in 1..=self.config.lookahead_batches {
            let next = BatchId(batch.0 + ahead);
            match self.residency.state(next) {
                None | Some(ResidencyState::Requested) | Some(ResidencyState::Evicted) => {
                    debug!(batch = next.0, "prefetching");
                    self.start_fetch(next);
                }
                _ => {}
            }
        }
    }

    fn evict(&mut self, chunk: ChunkIndex) {
        let batch = chunk.batch(self.config.chunks_per_batch()).0;
        let lo = batch.saturating_sub(1);
        let hi = batch + self.config.lookahead_batches;
        for old in self.residency.outside(lo, hi) {
            if matches!(
                self.residency.state(old),
                Some(ResidencyState::Resident) | Some(ResidencyState::Compiling)
            ) {
                self.send(WorkerRequest::ClearBatch { batch_id: old });
            }
            self.residency.set(old, ResidencyState::Evicted);
            debug!(batch = old.0, "batch evicted");
        }

        let keep = chunk.0.saturating_sub(1)..=chunk.0 + 2;
        self.chunks.retain(|c, _| keep.contains(&c.0));
        self.requested.retain(|c| keep.contains(&c.0));
    }

    /// Swap the current chunk into the live set once it has arrived. Until
    /// then the previous chunk keeps animating.
    fn promote(&mut self, chunk: ChunkIndex) {
        if self.live_chunk == Some(chunk) {
            return;
        }
        if let Some(trips) = self.chunks.get(&chunk) {
            self.live.replace_with(trips.iter().cloned());
            self.live_chunk = Some(chunk);
            debug!(chunk = chunk.0, trips = self.live.len(), "chunk live");
        }
    }
}

impl Tick for Playback {
    fn tick(&mut self, real_delta_ms: f64) {
        Playback::tick(self, real_delta_ms);
    }
}
