use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use compute::CompileParams;
use foundation::ids::{BatchId, ChunkIndex};
use foundation::time::{Time, TimeSpan};
use serde::{Deserialize, Serialize};

/// Playback and streaming settings for one session.
///
/// Missing fields fall back to [`PlaybackConfig::default`], so a config file
/// only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Window start as Unix milliseconds. Simulated time 0 maps here.
    pub window_start_ms: i64,
    pub fade_duration_sim_seconds: f64,
    pub batch_duration_secs: u64,
    pub chunk_duration_secs: u64,
    /// Fraction of the current batch after which later batches are prefetched.
    pub prefetch_threshold: f64,
    pub lookahead_batches: u64,
    pub ease_distance_meters: f64,
    pub ease_time_multiplier: f64,
    pub max_frame_delta_ms: f64,
    pub speed_multiplier: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            window_start_ms: 0,
            fade_duration_sim_seconds: 30.0,
            batch_duration_secs: 3600,
            chunk_duration_secs: 60,
            prefetch_threshold: 0.6,
            lookahead_batches: 2,
            ease_distance_meters: 300.0,
            ease_time_multiplier: 2.0,
            max_frame_delta_ms: 100.0,
            speed_multiplier: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid { field: &'static str, reason: String },
    Parse(String),
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
            ConfigError::Parse(msg) => write!(f, "config parse error: {msg}"),
            ConfigError::Io(msg) => write!(f, "config read error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl PlaybackConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_duration_secs == 0 {
            return Err(invalid("batch_duration_secs", "must be positive"));
        }
        if self.chunk_duration_secs == 0 {
            return Err(invalid("chunk_duration_secs", "must be positive"));
        }
        if self.batch_duration_secs % self.chunk_duration_secs != 0 {
            return Err(invalid(
                "chunk_duration_secs",
                format!(
                    "{} does not divide batch duration {}",
                    self.chunk_duration_secs, self.batch_duration_secs
                ),
            ));
        }
        if !(self.prefetch_threshold > 0.0 && self.prefetch_threshold <= 1.0) {
            return Err(invalid("prefetch_threshold", "must be in (0, 1]"));
        }
        if !(self.fade_duration_sim_seconds >= 0.0 && self.fade_duration_sim_seconds.is_finite()) {
            return Err(invalid("fade_duration_sim_seconds", "must be finite and >= 0"));
        }
        if !(self.ease_distance_meters >= 0.0 && self.ease_distance_meters.is_finite()) {
            return Err(invalid("ease_distance_meters", "must be finite and >= 0"));
        }
        if !(self.ease_time_multiplier >= 1.0 && self.ease_time_multiplier.is_finite()) {
            return Err(invalid("ease_time_multiplier", "must be finite and >= 1"));
        }
        if !(self.max_frame_delta_ms > 0.0 && self.max_frame_delta_ms.is_finite()) {
            return Err(invalid("max_frame_delta_ms", "must be finite and positive"));
        }
        if !self.speed_multiplier.is_finite() {
            return Err(invalid("speed_multiplier", "must be finite"));
        }
        self.window_start()?;
        Ok(())
    }

    pub fn window_start(&self) -> Result<DateTime<Utc>, ConfigError> {
        DateTime::from_timestamp_millis(self.window_start_ms)
            .ok_or_else(|| invalid("window_start_ms", "out of range"))
    }

    pub fn chunks_per_batch(&self) -> u64 {
        (self.batch_duration_secs / self.chunk_duration_secs.max(1)).max(1)
    }

    /// Chunk containing simulated second `t`. Negative times belong to chunk 0.
    pub fn chunk_at(&self, t: f64) -> ChunkIndex {
        let secs = t.max(0.0) / self.chunk_duration_secs.max(1) as f64;
        ChunkIndex(secs.floor() as u64)
    }

    pub fn chunk_span(&self, chunk: ChunkIndex) -> TimeSpan {
        let d = self.chunk_duration_secs as f64;
        TimeSpan::new(chunk.0 as f64 * d, (chunk.0 + 1) as f64 * d)
    }

    pub fn batch_span(&self, batch: BatchId) -> TimeSpan {
        let d = self.batch_duration_secs as f64;
        TimeSpan::new(batch.0 as f64 * d, (batch.0 + 1) as f64 * d)
    }

    /// Fraction of `batch` elapsed at simulated second `t`.
    pub fn batch_progress(&self, batch: BatchId, t: f64) -> f64 {
        self.batch_span(batch).progress(Time(t))
    }

    pub fn compile_params(&self) -> Result<CompileParams, ConfigError> {
        Ok(CompileParams {
            window_start: self.window_start()?,
            fade_duration_seconds: self.fade_duration_sim_seconds,
            ease_distance_meters: self.ease_distance_meters,
            ease_time_multiplier: self.ease_time_multiplier,
        })
    }
}
