//! Data carried between the pipeline stages.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, VoiceError};
use crate::frontend::FeatureScale;

/// Mono audio at a fixed sample rate. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs() as f64)
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// A sequence of normalized mel frames.
///
/// Every frame has exactly `n_mels` values expressed in `scale`; the
/// constructors reject anything else so downstream stages never see ragged input.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticFeatures {
    frames: Vec<Vec<f32>>,
    n_mels: usize,
    scale: FeatureScale,
}

impl AcousticFeatures {
    pub fn new(frames: Vec<Vec<f32>>, n_mels: usize, scale: FeatureScale) -> Result<Self> {
        if n_mels == 0 {
            return Err(VoiceError::invalid("feature dimensionality must be non-zero"));
        }
        if let Some((i, frame)) = frames.iter().enumerate().find(|(_, f)| f.len() != n_mels) {
            return Err(VoiceError::invalid(format!(
                "frame {} has {} values, expected {}",
                i,
                frame.len(),
                n_mels
            )));
        }
        Ok(Self {
            frames,
            n_mels,
            scale,
        })
    }

    pub fn empty(n_mels: usize, scale: FeatureScale) -> Self {
        Self {
            frames: Vec::new(),
            n_mels,
            scale,
        }
    }

    pub fn push(&mut self, frame: Vec<f32>) -> Result<()> {
        if frame.len() != self.n_mels {
            return Err(VoiceError::invalid(format!(
                "frame has {} values, expected {}",
                frame.len(),
                self.n_mels
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Appends `count` frames of silence in this sequence's normalization.
    pub fn push_silence(&mut self, count: usize) {
        let silence = self.scale.silence();
        for _ in 0..count {
            self.frames.push(vec![silence; self.n_mels]);
        }
    }

    pub fn frames(&self) -> &[Vec<f32>] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Vec<f32>> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn scale(&self) -> FeatureScale {
        self.scale
    }
}

/// Fixed-dimension, L2-normalized identity vector of a reference voice.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEmbedding {
    values: Arc<[f32]>,
}

impl SpeakerEmbedding {
    /// Normalizes `raw` to unit length. Zero or non-finite vectors are rejected.
    pub fn from_raw(raw: Vec<f32>) -> Result<Self> {
        if raw.is_empty() {
            return Err(VoiceError::invalid("embedding cannot be empty"));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(VoiceError::invalid("embedding contains non-finite values"));
        }
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(VoiceError::invalid("embedding has zero norm"));
        }
        let values: Vec<f32> = raw.into_iter().map(|v| v / norm).collect();
        Ok(Self {
            values: values.into(),
        })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Both sides are unit length, so this is a plain dot product.
    pub fn cosine_similarity(&self, other: &SpeakerEmbedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// Unit of streamed delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub index: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub is_final: bool,
}

impl AudioChunk {
    pub fn new(index: u64, samples: Vec<f32>, sample_rate: u32, is_final: bool) -> Self {
        Self {
            index,
            samples,
            sample_rate,
            is_final,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.samples.len() as f64 / self.sample_rate as f64) * 1000.0
    }
}
