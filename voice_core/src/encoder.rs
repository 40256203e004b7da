//! Speaker encoder: reference utterance -> fixed-size identity embedding.

use std::ops::Range;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};
use crate::frontend::{
    normalize_volume, resample, trim_long_silences, validate_samples, FeatureFrontend, MelConfig,
    VadConfig,
};
use crate::nn::{l2_normalize, relu_inplace, Linear, LstmCell};
use crate::traits::Embeddable;
use crate::types::SpeakerEmbedding;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub mel: MelConfig,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub embedding_dim: usize,
    #[serde(default = "default_true")]
    pub final_relu: bool,
    pub partial_frames: usize,
    pub partials_per_sec: f32,
    pub min_coverage: f32,
    pub min_duration_secs: f32,
    /// Target loudness in dBFS; quiet references are raised to it, loud ones left alone.
    #[serde(default)]
    pub target_dbfs: Option<f32>,
    #[serde(default)]
    pub trim_silence: Option<VadConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            mel: MelConfig::encoder_16k(),
            hidden_size: 256,
            num_layers: 3,
            embedding_dim: 256,
            final_relu: true,
            partial_frames: 160,
            partials_per_sec: 1.3,
            min_coverage: 0.75,
            min_duration_secs: 1.6,
            target_dbfs: Some(-30.0),
            trim_silence: Some(VadConfig::default()),
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        self.mel.validate()?;
        if self.num_layers == 0 || self.hidden_size == 0 || self.embedding_dim == 0 {
            return Err(VoiceError::model_load(
                "encoder layers, hidden size and embedding size must be non-zero",
            ));
        }
        if self.partial_frames == 0 || self.partials_per_sec <= 0.0 {
            return Err(VoiceError::model_load("invalid partial window settings"));
        }
        if !(0.0..=1.0).contains(&self.min_coverage) {
            return Err(VoiceError::model_load(format!(
                "min_coverage {} outside [0, 1]",
                self.min_coverage
            )));
        }
        Ok(())
    }

    /// Frames between the starts of consecutive partials.
    pub fn partial_step(&self) -> usize {
        let frames_per_sec = self.mel.sample_rate as f32 / self.mel.hop_length as f32;
        ((frames_per_sec / self.partials_per_sec).round() as usize).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderParams {
    pub lstm: Vec<LstmCell>,
    pub proj: Linear,
}

impl EncoderParams {
    /// Seeded parameters with the shapes `config` expects.
    pub fn random(config: &EncoderConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let lstm = (0..config.num_layers)
            .map(|i| {
                let input = if i == 0 { config.mel.n_mels } else { config.hidden_size };
                LstmCell::random(&mut rng, input, config.hidden_size)
            })
            .collect();
        let proj = Linear::random(&mut rng, config.hidden_size, config.embedding_dim);
        Self { lstm, proj }
    }

    fn check(&self, config: &EncoderConfig) -> Result<()> {
        if self.lstm.len() != config.num_layers {
            return Err(VoiceError::model_load(format!(
                "encoder has {} LSTM layers, config expects {}",
                self.lstm.len(),
                config.num_layers
            )));
        }
        for (i, cell) in self.lstm.iter().enumerate() {
            let input = if i == 0 { config.mel.n_mels } else { config.hidden_size };
            cell.check(&format!("lstm.{}", i), input, config.hidden_size)?;
        }
        self.proj.check("proj", config.hidden_size, config.embedding_dim)
    }
}

/// Embedding of one utterance together with the partial windows it was averaged from.
#[derive(Debug, Clone)]
pub struct UtteranceEmbedding {
    pub embedding: SpeakerEmbedding,
    pub partials: Vec<Array1<f32>>,
    /// Frame ranges of each partial; the last may extend past the real frames.
    pub ranges: Vec<Range<usize>>,
}

#[derive(Debug)]
pub struct SpeakerEncoder {
    config: EncoderConfig,
    frontend: FeatureFrontend,
    params: EncoderParams,
}

impl SpeakerEncoder {
    pub fn new(config: EncoderConfig, params: EncoderParams) -> Result<Self> {
        config.validate()?;
        params.check(&config)?;
        let frontend = FeatureFrontend::new(config.mel.clone())?;
        tracing::info!(
            layers = config.num_layers,
            hidden = config.hidden_size,
            dim = config.embedding_dim,
            "Speaker encoder ready"
        );
        Ok(Self {
            config,
            frontend,
            params,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Partial window frame ranges for an utterance of `n_frames` frames.
    pub fn partial_ranges(&self, n_frames: usize) -> Vec<Range<usize>> {
        let size = self.config.partial_frames;
        let step = self.config.partial_step();
        let steps = (n_frames + step + 1).saturating_sub(size).max(1);

        let mut ranges: Vec<Range<usize>> = (0..steps).step_by(step).map(|s| s..s + size).collect();
        if let Some(last) = ranges.last() {
            let covered = n_frames.saturating_sub(last.start) as f32 / size as f32;
            if covered < self.config.min_coverage && ranges.len() > 1 {
                ranges.pop();
            }
        }
        ranges
    }

    pub fn embed_utterance(&self, samples: &[f32], sample_rate: u32) -> Result<UtteranceEmbedding> {
        validate_samples(samples)?;
        let target_sr = self.config.mel.sample_rate;
        let mut wav = resample(samples, sample_rate, target_sr)?;

        if let Some(target) = self.config.target_dbfs {
            normalize_volume(&mut wav, target, true);
        }
        if let Some(vad) = &self.config.trim_silence {
            wav = trim_long_silences(&wav, target_sr, vad);
        }

        let duration_secs = wav.len() as f32 / target_sr as f32;
        if duration_secs < self.config.min_duration_secs {
            return Err(VoiceError::InsufficientAudio {
                duration_secs,
                min_secs: self.config.min_duration_secs,
            });
        }

        let features = self.frontend.analyze(&wav)?;
        let n_frames = features.len();
        let ranges = self.partial_ranges(n_frames);
        let padded_len = ranges.last().map(|r| r.end).unwrap_or(0).max(n_frames);

        let n_mels = self.config.mel.n_mels;
        let silence = self.frontend.silence_frame();
        let mut mels = Array2::<f32>::zeros((padded_len, n_mels));
        for (t, mut row) in mels.rows_mut().into_iter().enumerate() {
            match features.frames().get(t) {
                Some(frame) => row.assign(&ndarray::ArrayView1::from(frame.as_slice())),
                None => row.assign(&ndarray::ArrayView1::from(silence.as_slice())),
            }
        }

        let partials: Vec<Array1<f32>> = ranges
            .iter()
            .map(|r| self.embed_partial(mels.slice(ndarray::s![r.clone(), ..])))
            .collect();

        let mut mean = Array1::<f32>::zeros(self.config.embedding_dim);
        for p in &partials {
            mean += p;
        }
        mean /= partials.len().max(1) as f32;
        let embedding = SpeakerEmbedding::from_raw(mean.to_vec())?;

        tracing::debug!(
            frames = n_frames,
            partials = partials.len(),
            duration_secs,
            "Embedded reference utterance"
        );
        Ok(UtteranceEmbedding {
            embedding,
            partials,
            ranges,
        })
    }

    fn embed_partial(&self, frames: ndarray::ArrayView2<'_, f32>) -> Array1<f32> {
        let mut hidden = frames.to_owned();
        for cell in &self.params.lstm {
            hidden = cell.run(hidden.view()).0;
        }
        let last = hidden.row(hidden.nrows() - 1);
        let mut out = self.params.proj.forward(last);
        if self.config.final_relu {
            relu_inplace(&mut out);
        }
        l2_normalize(&mut out);
        out
    }
}

impl Embeddable for SpeakerEncoder {
    fn sample_rate(&self) -> u32 {
        self.config.mel.sample_rate
    }

    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn embed(&self, samples: &[f32], sample_rate: u32) -> Result<SpeakerEmbedding> {
        Ok(self.embed_utterance(samples, sample_rate)?.embedding)
    }
}
