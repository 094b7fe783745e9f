use std::thread::JoinHandle;

use compute::{CompileParams, compile_batch};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::cache::BatchStore;
use crate::config::PlaybackConfig;
use crate::protocol::{
    InitParams, ProtocolError, RequestContext, WorkerRequest, WorkerResponse, decode_request,
};

struct Session {
    config: PlaybackConfig,
    params: CompileParams,
}

/// The compiler side of the protocol, without any threading.
///
/// Owns the batch store; every request yields at most one response.
#[derive(Default)]
pub struct CompilerUnit {
    session: Option<Session>,
    store: BatchStore,
}

impl CompilerUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    fn start_session(&mut self, init: InitParams, context: RequestContext) -> WorkerResponse {
        let session = init.to_config().and_then(|config| {
            let params = init.compile_params()?;
            Ok(Session { config, params })
        });
        match session {
            Ok(session) => {
                self.store.clear();
                self.session = Some(session);
                info!(
                    generation = init.generation,
                    window_start_ms = init.window_start_ms,
                    "compiler initialized"
                );
                WorkerResponse::Ready {
                    generation: init.generation,
                }
            }
            Err(err) => {
                warn!(%err, "rejected init");
                WorkerResponse::error(&err, Some(context))
            }
        }
    }

    pub fn handle(&mut self, request: WorkerRequest) -> Option<WorkerResponse> {
        let context = request.context();
        let request = match request {
            WorkerRequest::Init(init) => return Some(self.start_session(init, context)),
            other => other,
        };

        let Some(session) = &self.session else {
            return Some(WorkerResponse::error(
                &ProtocolError::NotInitialized,
                Some(context),
            ));
        };

        match request {
            WorkerRequest::Init(_) => None,
            WorkerRequest::LoadBatch {
                batch_id,
                raw_trips,
            } => {
                let compiled = compile_batch(&raw_trips, &session.params);
                let trip_count = compiled.trips.len();
                self.store.insert(batch_id, compiled.trips);
                debug!(
                    batch = batch_id.0,
                    trip_count,
                    dropped = compiled.dropped,
                    "batch compiled"
                );
                Some(WorkerResponse::BatchProcessed {
                    batch_id,
                    trip_count,
                    dropped_count: compiled.dropped,
                })
            }
            WorkerRequest::RequestChunk { chunk_index } => {
                let per_batch = session.config.chunks_per_batch();
                let window = session.config.chunk_span(chunk_index);
                Some(match self.store.chunk(chunk_index, &window, per_batch) {
                    Some(trips) => WorkerResponse::ChunkResponse { chunk_index, trips },
                    None => WorkerResponse::RequestBatch {
                        batch_id: chunk_index.batch(per_batch),
                    },
                })
            }
            WorkerRequest::ClearBatch { batch_id } => {
                if self.store.remove(batch_id) {
                    debug!(batch = batch_id.0, "batch cleared");
                }
                None
            }
        }
    }
}

/// Playback-side handle to the compiler thread.
///
/// Dropping the handle closes the request channel; the thread finishes the
/// request it is on and exits.
pub struct WorkerHandle {
    requests: Option<mpsc::UnboundedSender<WorkerRequest>>,
    responses: mpsc::UnboundedReceiver<WorkerResponse>,
    /// Lets the handle answer decode failures on the same response stream.
    local: mpsc::UnboundedSender<WorkerResponse>,
    thread: Option<JoinHandle<()>>,
}

pub fn spawn_worker() -> std::io::Result<WorkerHandle> {
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<WorkerRequest>();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel::<WorkerResponse>();
    let worker_tx = resp_tx.clone();

    let thread = std::thread::Builder::new()
        .name("trip-compiler".into())
        .spawn(move || {
            let mut unit = CompilerUnit::new();
            while let Some(request) = req_rx.blocking_recv() {
                if let Some(response) = unit.handle(request)
                    && worker_tx.send(response).is_err()
                {
                    break;
                }
            }
            debug!("compiler thread exiting");
        })?;

    Ok(WorkerHandle {
        requests: Some(req_tx),
        responses: resp_rx,
        local: resp_tx,
        thread: Some(thread),
    })
}

impl WorkerHandle {
    pub fn send(&self, request: WorkerRequest) -> Result<(), ProtocolError> {
        let requests = self.requests.as_ref().ok_or(ProtocolError::Disconnected)?;
        requests
            .send(request)
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Wire entry point. A message that does not decode is answered with an
    /// `error` response carrying no context.
    pub fn send_json(&self, json: &str) -> Result<(), ProtocolError> {
        match decode_request(json) {
            Ok(request) => self.send(request),
            Err(err) => {
                warn!(%err, "dropping undecodable request");
                self.local
                    .send(WorkerResponse::error(&err, None))
                    .map_err(|_| ProtocolError::Disconnected)
            }
        }
    }

    /// Next response if one is ready. Never blocks.
    pub fn try_recv(&mut self) -> Option<WorkerResponse> {
        match self.responses.try_recv() {
            Ok(response) => Some(response),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub async fn recv(&mut self) -> Option<WorkerResponse> {
        self.responses.recv().await
    }

    /// Close the request channel and wait for the thread.
    pub fn shutdown(mut self) {
        self.requests = None;
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("compiler thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CompilerUnit, spawn_worker};
    use crate::config::PlaybackConfig;
    use crate::protocol::{InitParams, RequestKind, WorkerRequest, WorkerResponse};
    use chrono::{DateTime, Duration, Utc};
    use foundation::ids::{BatchId, ChunkIndex, TripId};
    use pretty_assertions::assert_eq;
    use scene::trip::{BikeType, RawTrip, RiderCategory};
    use std::sync::Arc;

    const WINDOW_START_MS: i64 = 1_717_228_800_000;

    fn init(generation: u64) -> WorkerRequest {
        let config = PlaybackConfig {
            window_start_ms: WINDOW_START_MS,
            fade_duration_sim_seconds: 5.0,
            ..PlaybackConfig::default()
        };
        WorkerRequest::Init(InitParams::from_config(&config, generation))
    }

    fn row(id: &str, offset_s: i64, duration_s: i64) -> RawTrip {
        let window: DateTime<Utc> = "2024-06-01T08:00:00Z".parse().unwrap();
        let started_at = window + Duration::seconds(offset_s);
        RawTrip {
            id: TripId::new(id),
            start_station_id: "a".into(),
            end_station_id: "b".into(),
            started_at,
            ended_at: started_at + Duration::seconds(duration_s),
            bike_type: BikeType::ClassicBike,
            rider_category: RiderCategory::Member,
            start_lat: 40.70,
            start_lng: -74.00,
            end_lat: Some(40.71),
            end_lng: Some(-74.00),
            route_geometry: None,
            route_distance_m: None,
        }
    }

    fn load(batch: u64, rows: Vec<RawTrip>) -> WorkerRequest {
        WorkerRequest::LoadBatch {
            batch_id: BatchId(batch),
            raw_trips: Arc::new(rows),
        }
    }

    fn chunk_ids(response: Option<WorkerResponse>) -> Vec<String> {
        match response {
            Some(WorkerResponse::ChunkResponse { trips, .. }) => {
                trips.iter().map(|t| t.id.as_str().to_string()).collect()
            }
            other => panic!("expected chunk_response, got {other:?}"),
        }
    }

    #[test]
    fn requests_before_init_are_errors() {
        let mut unit = CompilerUnit::new();
        let response = unit.handle(WorkerRequest::RequestChunk {
            chunk_index: ChunkIndex(4),
        });
        match response {
            Some(WorkerResponse::Error { message, context }) => {
                assert_eq!(message, "not initialized");
                let context = context.unwrap();
                assert_eq!(context.kind, RequestKind::RequestChunk);
                assert_eq!(context.chunk_index, Some(ChunkIndex(4)));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!unit.is_initialized());
    }

    #[test]
    fn unloaded_chunk_asks_for_its_batch() {
        let mut unit = CompilerUnit::new();
        assert!(matches!(
            unit.handle(init(1)),
            Some(WorkerResponse::Ready { generation: 1 })
        ));
        let response = unit.handle(WorkerRequest::RequestChunk {
            chunk_index: ChunkIndex(61),
        });
        assert!(matches!(
            response,
            Some(WorkerResponse::RequestBatch { batch_id: BatchId(1) })
        ));
    }

    #[test]
    fn load_then_chunk_then_clear() {
        let mut unit = CompilerUnit::new();
        unit.handle(init(1));

        let mut bad = row("bad", 30, 60);
        bad.end_lat = None;
        let response = unit.handle(load(0, vec![row("a", 10, 100), row("b", 400, 60), bad]));
        match response {
            Some(WorkerResponse::BatchProcessed {
                batch_id,
                trip_count,
                dropped_count,
            }) => {
                assert_eq!(batch_id, BatchId(0));
                assert_eq!(trip_count, 2);
                assert_eq!(dropped_count, 1);
            }
            other => panic!("expected batch_processed, got {other:?}"),
        }

        let ids = chunk_ids(unit.handle(WorkerRequest::RequestChunk {
            chunk_index: ChunkIndex(1),
        }));
        assert_eq!(ids, vec!["a"]);

        assert!(
            unit.handle(WorkerRequest::ClearBatch {
                batch_id: BatchId(0)
            })
            .is_none()
        );
        assert!(matches!(
            unit.handle(WorkerRequest::RequestChunk {
                chunk_index: ChunkIndex(1)
            }),
            Some(WorkerResponse::RequestBatch { batch_id: BatchId(0) })
        ));
    }

    #[test]
    fn reload_replaces_batch_contents() {
        let mut unit = CompilerUnit::new();
        unit.handle(init(1));
        unit.handle(load(0, vec![row("a", 10, 100)]));
        unit.handle(load(0, vec![row("b", 20, 100)]));
        let ids = chunk_ids(unit.handle(WorkerRequest::RequestChunk {
            chunk_index: ChunkIndex(0),
        }));
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn chunk_spans_batch_boundary() {
        let mut unit = CompilerUnit::new();
        unit.handle(init(1));
        unit.handle(load(0, vec![row("late", 3550, 200)]));
        unit.handle(load(1, vec![row("fresh", 3605, 30)]));
        let ids = chunk_ids(unit.handle(WorkerRequest::RequestChunk {
            chunk_index: ChunkIndex(60),
        }));
        assert_eq!(ids, vec!["fresh", "late"]);
    }

    #[test]
    fn last_chunk_of_a_batch_shows_next_batch_fading_in() {
        let mut unit = CompilerUnit::new();
        unit.handle(init(1));
        unit.handle(load(0, vec![]));
        unit.handle(load(1, vec![row("fresh", 3602, 60)]));
        let ids = chunk_ids(unit.handle(WorkerRequest::RequestChunk {
            chunk_index: ChunkIndex(59),
        }));
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn reinit_clears_the_store() {
        let mut unit = CompilerUnit::new();
        unit.handle(init(1));
        unit.handle(load(0, vec![row("a", 10, 100)]));
        assert_eq!(unit.store().trip_count(), 1);
        unit.handle(init(2));
        assert_eq!(unit.store().trip_count(), 0);
    }

    #[test]
    fn invalid_init_is_rejected_with_context() {
        let mut unit = CompilerUnit::new();
        let WorkerRequest::Init(mut params) = init(1) else {
            unreachable!()
        };
        params.batch_duration_secs = 0;
        match unit.handle(WorkerRequest::Init(params)) {
            Some(WorkerResponse::Error { context, .. }) => {
                assert_eq!(context.unwrap().kind, RequestKind::Init);
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!unit.is_initialized());
    }

    #[tokio::test]
    async fn threaded_worker_answers_in_order() {
        let mut worker = spawn_worker().unwrap();
        worker.send(init(7)).unwrap();
        worker.send(load(0, vec![row("a", 10, 100)])).unwrap();
        worker
            .send(WorkerRequest::RequestChunk {
                chunk_index: ChunkIndex(0),
            })
            .unwrap();

        assert!(matches!(
            worker.recv().await,
            Some(WorkerResponse::Ready { generation: 7 })
        ));
        assert!(matches!(
            worker.recv().await,
            Some(WorkerResponse::BatchProcessed { trip_count: 1, .. })
        ));
        assert_eq!(chunk_ids(worker.recv().await), vec!["a"]);
        worker.shutdown();
    }

    #[tokio::test]
    async fn malformed_json_yields_error_without_context() {
        let mut worker = spawn_worker().unwrap();
        worker.send_json("{\"type\": \"load_batch\", ").unwrap();
        match worker.recv().await {
            Some(WorkerResponse::Error { message, context }) => {
                assert!(message.starts_with("malformed request"));
                assert_eq!(context, None);
            }
            other => panic!("expected error, got {other:?}"),
        }

        worker
            .send_json(r#"{"type":"request_chunk","chunk_index":0}"#)
            .unwrap();
        assert!(matches!(
            worker.recv().await,
            Some(WorkerResponse::Error { .. })
        ));
        assert!(worker.try_recv().is_none());
    }
}
