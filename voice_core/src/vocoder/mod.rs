//! Mel frames -> waveform, in one pass or streamed in overlapping windows.

mod griffin_lim;
mod stream;

pub use griffin_lim::GriffinLimVocoder;
pub use stream::{StreamWindowing, StreamingVocoder, VocoderStream};

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{Result, VoiceError};
use crate::frontend::MelConfig;
use crate::nn::{relu_inplace, Conv1d, Linear};
use crate::traits::Vocodable;
use crate::types::AcousticFeatures;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocoderConfig {
    pub mel: MelConfig,
    pub channels: usize,
    pub layers: usize,
    pub kernel: usize,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            mel: MelConfig::synthesizer_16k(),
            channels: 128,
            layers: 4,
            kernel: 5,
        }
    }
}

impl VocoderConfig {
    pub fn validate(&self) -> Result<()> {
        self.mel.validate()?;
        if self.channels == 0 || self.layers == 0 {
            return Err(VoiceError::model_load("vocoder needs at least one conv layer"));
        }
        Ok(())
    }

    /// Frames on each side that influence one frame's grain.
    pub fn receptive_radius(&self) -> usize {
        self.layers * (self.kernel / 2)
    }

    pub fn grain_len(&self) -> usize {
        2 * self.mel.hop_length
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocoderParams {
    pub convs: Vec<Conv1d>,
    pub grain: Linear,
}

impl VocoderParams {
    pub fn random(config: &VocoderConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let convs = (0..config.layers)
            .map(|i| {
                let input = if i == 0 { config.mel.n_mels } else { config.channels };
                Conv1d::random(&mut rng, input, config.channels, config.kernel)
            })
            .collect();
        let grain = Linear::random(&mut rng, config.channels, config.grain_len());
        Self { convs, grain }
    }

    fn check(&self, config: &VocoderConfig) -> Result<()> {
        if self.convs.len() != config.layers {
            return Err(VoiceError::model_load(format!(
                "vocoder has {} conv layers, config expects {}",
                self.convs.len(),
                config.layers
            )));
        }
        for (i, conv) in self.convs.iter().enumerate() {
            let input = if i == 0 { config.mel.n_mels } else { config.channels };
            conv.check(&format!("convs.{}", i), input, config.channels, config.kernel)?;
        }
        self.grain.check("grain", config.channels, config.grain_len())
    }
}

/// Convolutional frame-to-grain vocoder.
///
/// Frame `g` produces a Hann-windowed grain of `2 * hop` samples centred on
/// sample `g * hop + hop / 2`; grains are overlap-added at `hop` stride so the
/// output for `n` frames holds exactly `n * hop` samples.
#[derive(Debug)]
pub struct NeuralVocoder {
    config: VocoderConfig,
    params: VocoderParams,
    grain_window: Vec<f32>,
}

impl NeuralVocoder {
    pub fn new(config: VocoderConfig, params: VocoderParams) -> Result<Self> {
        config.validate()?;
        params.check(&config)?;
        let len = config.grain_len();
        let grain_window = (0..len)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / len as f32).cos())
            .collect();
        tracing::info!(
            layers = config.layers,
            channels = config.channels,
            radius = config.receptive_radius(),
            "Vocoder ready"
        );
        Ok(Self {
            config,
            params,
            grain_window,
        })
    }

    pub fn config(&self) -> &VocoderConfig {
        &self.config
    }

    /// Lazily vocode `features` in overlapping windows.
    pub fn vocode_stream<'v>(
        &'v self,
        features: &AcousticFeatures,
        windowing: StreamWindowing,
        cancel: CancelToken,
    ) -> Result<VocoderStream<'v>> {
        VocoderStream::new(self, features.frames().to_vec(), windowing, cancel)
    }

    fn grains(&self, frames: &[Vec<f32>]) -> Array2<f32> {
        let n_mels = self.config.mel.n_mels;
        let mut x = Array2::<f32>::zeros((frames.len(), n_mels));
        for (mut row, frame) in x.axis_iter_mut(Axis(0)).zip(frames) {
            row.assign(&ndarray::ArrayView1::from(frame.as_slice()));
        }
        for conv in &self.params.convs {
            x = conv.forward(x.view());
            relu_inplace(&mut x);
        }
        let mut grains = self.params.grain.forward_rows(x.view());
        for mut grain in grains.axis_iter_mut(Axis(0)) {
            for (s, &w) in grain.iter_mut().zip(&self.grain_window) {
                *s = s.tanh() * w;
            }
        }
        grains
    }
}

impl Vocodable for NeuralVocoder {
    fn sample_rate(&self) -> u32 {
        self.config.mel.sample_rate
    }

    fn hop_length(&self) -> usize {
        self.config.mel.hop_length
    }

    fn n_mels(&self) -> usize {
        self.config.mel.n_mels
    }

    fn context_frames(&self) -> usize {
        // Grains reach half a hop into the neighbouring frame on each side
        self.config.receptive_radius() + 1
    }

    fn render(&self, frames: &[Vec<f32>], start: usize, end: usize) -> Result<Vec<f32>> {
        if start > end || end > frames.len() {
            return Err(VoiceError::invalid(format!(
                "render range {}..{} outside {} frames",
                start,
                end,
                frames.len()
            )));
        }
        if let Some(bad) = frames.iter().find(|f| f.len() != self.config.mel.n_mels) {
            return Err(VoiceError::invalid(format!(
                "frame has {} values, vocoder expects {}",
                bad.len(),
                self.config.mel.n_mels
            )));
        }
        let hop = self.config.mel.hop_length;
        let mut out = vec![0.0f32; (end - start) * hop];
        if start == end {
            return Ok(out);
        }

        let context = self.context_frames();
        let lo = start.saturating_sub(context);
        let hi = (end + context).min(frames.len());
        let grains = self.grains(&frames[lo..hi]);

        let out_start = (start * hop) as isize;
        let out_end = (end * hop) as isize;
        let half = (hop / 2) as isize;
        for (offset, grain) in grains.axis_iter(Axis(0)).enumerate() {
            let g = (lo + offset) as isize;
            let grain_start = g * hop as isize - half;
            for (j, &s) in grain.iter().enumerate() {
                let pos = grain_start + j as isize;
                if pos >= out_start && pos < out_end {
                    out[(pos - out_start) as usize] += s;
                }
            }
        }
        Ok(out)
    }
}
