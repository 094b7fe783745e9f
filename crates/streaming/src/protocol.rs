//! Messages between the playback thread and the compiler worker.
//!
//! The same enums travel over the in-process channels and, via
//! [`decode_request`], over any JSON transport:
//! - requests (playback → worker): init, load_batch, request_chunk, clear_batch
//! - responses (worker → playback): ready, batch_processed, chunk_response,
//!   request_batch, error
//!
//! The worker answers requests strictly in submission order.

use std::fmt;
use std::sync::Arc;

use compute::CompileParams;
use foundation::ids::{BatchId, ChunkIndex};
use scene::trip::{CompiledTrip, RawTrip};
use serde::{Deserialize, Serialize};

use crate::config::PlaybackConfig;

/// Session parameters carried by `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    /// Echoed back in `ready` so stale acknowledgements can be told apart.
    pub generation: u64,
    pub window_start_ms: i64,
    pub fade_duration_sim_seconds: f64,
    pub ease_distance_meters: f64,
    pub ease_time_multiplier: f64,
    pub batch_duration_secs: u64,
    pub chunk_duration_secs: u64,
}

impl InitParams {
    pub fn from_config(config: &PlaybackConfig, generation: u64) -> Self {
        Self {
            generation,
            window_start_ms: config.window_start_ms,
            fade_duration_sim_seconds: config.fade_duration_sim_seconds,
            ease_distance_meters: config.ease_distance_meters,
            ease_time_multiplier: config.ease_time_multiplier,
            batch_duration_secs: config.batch_duration_secs,
            chunk_duration_secs: config.chunk_duration_secs,
        }
    }

    /// The same parameters viewed as a config, validated.
    pub fn to_config(&self) -> Result<PlaybackConfig, ProtocolError> {
        let config = PlaybackConfig {
            window_start_ms: self.window_start_ms,
            fade_duration_sim_seconds: self.fade_duration_sim_seconds,
            ease_distance_meters: self.ease_distance_meters,
            ease_time_multiplier: self.ease_time_multiplier,
            batch_duration_secs: self.batch_duration_secs,
            chunk_duration_secs: self.chunk_duration_secs,
            ..PlaybackConfig::default()
        };
        config
            .validate()
            .map_err(|e| ProtocolError::InvalidInit(e.to_string()))?;
        Ok(config)
    }

    pub fn compile_params(&self) -> Result<CompileParams, ProtocolError> {
        self.to_config()?
            .compile_params()
            .map_err(|e| ProtocolError::InvalidInit(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init(InitParams),
    LoadBatch {
        batch_id: BatchId,
        raw_trips: Arc<Vec<RawTrip>>,
    },
    RequestChunk {
        chunk_index: ChunkIndex,
    },
    ClearBatch {
        batch_id: BatchId,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Init,
    LoadBatch,
    RequestChunk,
    ClearBatch,
}

/// Summary of the request an error refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<ChunkIndex>,
}

impl WorkerRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            WorkerRequest::Init(_) => RequestKind::Init,
            WorkerRequest::LoadBatch { .. } => RequestKind::LoadBatch,
            WorkerRequest::RequestChunk { .. } => RequestKind::RequestChunk,
            WorkerRequest::ClearBatch { .. } => RequestKind::ClearBatch,
        }
    }

    pub fn context(&self) -> RequestContext {
        let (batch_id, chunk_index) = match self {
            WorkerRequest::Init(_) => (None, None),
            WorkerRequest::LoadBatch { batch_id, .. } | WorkerRequest::ClearBatch { batch_id } => {
                (Some(*batch_id), None)
            }
            WorkerRequest::RequestChunk { chunk_index } => (None, Some(*chunk_index)),
        };
        RequestContext {
            kind: self.kind(),
            batch_id,
            chunk_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready {
        generation: u64,
    },
    BatchProcessed {
        batch_id: BatchId,
        trip_count: usize,
        dropped_count: usize,
    },
    ChunkResponse {
        chunk_index: ChunkIndex,
        trips: Vec<Arc<CompiledTrip>>,
    },
    /// The chunk's batch is not loaded; fetch it and send `load_batch`.
    RequestBatch {
        batch_id: BatchId,
    },
    Error {
        message: String,
        #[serde(default)]
        context: Option<RequestContext>,
    },
}

impl WorkerResponse {
    pub fn error(err: &ProtocolError, context: Option<RequestContext>) -> Self {
        WorkerResponse::Error {
            message: err.to_string(),
            context,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Malformed(String),
    NotInitialized,
    InvalidInit(String),
    Encode(String),
    /// The worker thread is gone.
    Disconnected,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(msg) => write!(f, "malformed request: {msg}"),
            ProtocolError::NotInitialized => write!(f, "not initialized"),
            ProtocolError::InvalidInit(msg) => write!(f, "invalid init: {msg}"),
            ProtocolError::Encode(msg) => write!(f, "encode failed: {msg}"),
            ProtocolError::Disconnected => write!(f, "worker disconnected"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn decode_request(json: &str) -> Result<WorkerRequest, ProtocolError> {
    serde_json::from_str(json).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn encode_response(response: &WorkerResponse) -> Result<String, ProtocolError> {
    serde_json::to_string(response).map_err(|e| ProtocolError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{
        InitParams, ProtocolError, RequestKind, WorkerRequest, WorkerResponse, decode_request,
        encode_response,
    };
    use crate::config::PlaybackConfig;
    use foundation::ids::{BatchId, ChunkIndex};
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_tagged_requests() {
        let req = decode_request(r#"{"type":"request_chunk","chunk_index":61}"#).unwrap();
        assert_eq!(req.kind(), RequestKind::RequestChunk);
        let ctx = req.context();
        assert_eq!(ctx.chunk_index, Some(ChunkIndex(61)));
        assert_eq!(ctx.batch_id, None);

        let req = decode_request(r#"{"type":"clear_batch","batch_id":4}"#).unwrap();
        assert_eq!(req.context().batch_id, Some(BatchId(4)));

        let init = InitParams::from_config(&PlaybackConfig::default(), 3);
        let json = serde_json::to_string(&WorkerRequest::Init(init.clone())).unwrap();
        assert!(json.contains(r#""type":"init""#));
        match decode_request(&json).unwrap() {
            WorkerRequest::Init(decoded) => assert_eq!(decoded, init),
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            decode_request("{\"type\":\"request_chunk\""),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_request(r#"{"type":"warp_drive"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn responses_serialize_with_type_tag() {
        let json = encode_response(&WorkerResponse::RequestBatch {
            batch_id: BatchId(2),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"request_batch","batch_id":2}"#);

        let json = encode_response(&WorkerResponse::error(&ProtocolError::NotInitialized, None))
            .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"not initialized","context":null}"#);
    }

    #[test]
    fn init_with_bad_durations_is_rejected() {
        let mut init = InitParams::from_config(&PlaybackConfig::default(), 1);
        init.chunk_duration_secs = 7;
        assert!(matches!(
            init.compile_params(),
            Err(ProtocolError::InvalidInit(_))
        ));
    }
}
