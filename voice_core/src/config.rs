// Runtime configuration for the cloning pipeline

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{Result, VoiceError};
use crate::synthesizer::{DecodePolicy, MonotonicityPolicy};
use crate::text::SegmentConfig;
use crate::vocoder::StreamWindowing;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    #[serde(flatten)]
    pub windowing: StreamWindowing,
    /// Frames the synthesizer may run ahead of the vocoder.
    pub frame_queue_capacity: usize,
    /// Chunks buffered for a slow consumer before the vocoder blocks.
    pub chunk_queue_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            windowing: StreamWindowing::default(),
            frame_queue_capacity: 64,
            chunk_queue_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub streaming: StreamingConfig,
    pub cache: CacheConfig,
    pub segmentation: SegmentConfig,
    pub decode: DecodePolicy,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            VoiceError::model_load(format!("Failed to load {}: {}", path.as_ref().display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            VoiceError::model_load(format!("{} is not a valid pipeline config: {}", path.as_ref().display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `VOICE_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `VOICE_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        let streaming = &mut self.streaming;
        if let Some(v) = env_parse("VOICE_WINDOW_FRAMES") {
            streaming.windowing.window_frames = v;
        }
        if let Some(v) = env_parse("VOICE_OVERLAP_FRAMES") {
            streaming.windowing.overlap_frames = v;
        }
        if let Some(v) = env_parse("VOICE_CONTEXT_FRAMES") {
            streaming.windowing.context_frames = Some(v);
        }
        if let Some(v) = env_parse("VOICE_FRAME_QUEUE_CAPACITY") {
            streaming.frame_queue_capacity = v;
        }
        if let Some(v) = env_parse("VOICE_CHUNK_QUEUE_CAPACITY") {
            streaming.chunk_queue_capacity = v;
        }

        if let Some(v) = env_parse("VOICE_CACHE_ENABLED") {
            self.cache.enabled = v;
        }
        if let Some(v) = env_parse("VOICE_CACHE_SIZE") {
            self.cache.max_entries = v;
        }

        if let Some(v) = env_parse("VOICE_MAX_SEGMENT_TOKENS") {
            self.segmentation.max_tokens_per_segment = v;
        }

        let decode = &mut self.decode;
        if let Some(v) = env_parse("VOICE_STOP_THRESHOLD") {
            decode.stop_threshold = v;
        }
        if let Some(v) = env_parse("VOICE_STOP_DEBOUNCE") {
            decode.stop_debounce = v;
        }
        if let Some(v) = env_parse("VOICE_MAX_DECODER_STEPS") {
            decode.max_decoder_steps = v;
        }
        if let Some(v) = env_parse("VOICE_BACKWARD_TOLERANCE") {
            decode.backward_tolerance = v;
        }
        match std::env::var("VOICE_MONOTONICITY").ok().as_deref() {
            Some("warn") => decode.monotonicity = MonotonicityPolicy::Warn,
            Some("abort") => decode.monotonicity = MonotonicityPolicy::Abort,
            Some(other) => tracing::warn!(value = other, "Ignoring unknown VOICE_MONOTONICITY"),
            None => {}
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.streaming
            .windowing
            .validate()
            .map_err(|e| VoiceError::model_load(e.to_string()))?;
        if self.streaming.frame_queue_capacity == 0 || self.streaming.chunk_queue_capacity == 0 {
            return Err(VoiceError::model_load("queue capacities must be at least 1"));
        }
        self.decode.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decode.stop_debounce, 3);
        assert_eq!(config.decode.max_decoder_steps, 1000);
        assert_eq!(config.decode.monotonicity, MonotonicityPolicy::Warn);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            r#"{"streaming": {"window_frames": 16, "overlap_frames": 2}, "decode": {"stop_debounce": 5, "monotonicity": "abort"}}"#,
        )
        .unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.streaming.windowing.window_frames, 16);
        assert_eq!(config.streaming.frame_queue_capacity, 64);
        assert_eq!(config.decode.stop_debounce, 5);
        assert_eq!(config.decode.monotonicity, MonotonicityPolicy::Abort);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"streaming": {"window_frames": 4, "overlap_frames": 4}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&path),
            Err(VoiceError::ModelLoad(_))
        ));
        assert!(PipelineConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        // No other test reads these variables
        std::env::set_var("VOICE_MAX_DECODER_STEPS", "321");
        std::env::set_var("VOICE_STOP_DEBOUNCE", "not-a-number");
        let config = PipelineConfig::from_env();
        std::env::remove_var("VOICE_MAX_DECODER_STEPS");
        std::env::remove_var("VOICE_STOP_DEBOUNCE");

        assert_eq!(config.decode.max_decoder_steps, 321);
        assert_eq!(config.decode.stop_debounce, 3);
    }
}
