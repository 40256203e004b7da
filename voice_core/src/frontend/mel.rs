use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ndarray::{Array1, Array2};
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use super::resample::resample;
use super::signal::{preemphasis, validate_samples};
use crate::error::{Result, VoiceError};
use crate::types::AcousticFeatures;

/// Normalization applied to mel magnitudes.
///
/// The same variant must be used wherever features are produced or consumed;
/// a mismatch degrades audio silently instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureScale {
    /// Natural log after clamping to `floor`.
    LogClamp { floor: f32 },
    /// Decibels relative to `ref_level_db`, mapped linearly onto
    /// `[-max_abs_value, max_abs_value]` with `min_level_db` as the floor.
    SymmetricDb {
        min_level_db: f32,
        ref_level_db: f32,
        max_abs_value: f32,
    },
}

impl FeatureScale {
    pub fn normalize(&self, magnitude: f32) -> f32 {
        match *self {
            FeatureScale::LogClamp { floor } => magnitude.max(floor).ln(),
            FeatureScale::SymmetricDb {
                min_level_db,
                ref_level_db,
                max_abs_value,
            } => {
                let min_level = 10f32.powf(min_level_db / 20.0);
                let db = 20.0 * magnitude.max(min_level).log10() - ref_level_db;
                let scaled =
                    2.0 * max_abs_value * ((db - min_level_db) / -min_level_db) - max_abs_value;
                scaled.clamp(-max_abs_value, max_abs_value)
            }
        }
    }

    /// Inverse of [`normalize`](Self::normalize) inside the unclipped range.
    pub fn denormalize(&self, value: f32) -> f32 {
        match *self {
            FeatureScale::LogClamp { floor } => value.max(floor.ln()).exp(),
            FeatureScale::SymmetricDb {
                min_level_db,
                ref_level_db,
                max_abs_value,
            } => {
                let v = value.clamp(-max_abs_value, max_abs_value);
                let db = (v + max_abs_value) * -min_level_db / (2.0 * max_abs_value) + min_level_db;
                10f32.powf((db + ref_level_db) / 20.0)
            }
        }
    }

    /// Normalized value of a zero-magnitude bin.
    pub fn silence(&self) -> f32 {
        self.normalize(0.0)
    }

    /// Force a model output back into the representable range.
    pub fn clamp(&self, value: f32) -> f32 {
        match *self {
            FeatureScale::LogClamp { floor } => value.max(floor.ln()),
            FeatureScale::SymmetricDb { max_abs_value, .. } => {
                value.clamp(-max_abs_value, max_abs_value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub fmin: f32,
    pub fmax: f32,
    #[serde(default)]
    pub preemphasis: Option<f32>,
    pub scale: FeatureScale,
}

impl MelConfig {
    /// 25 ms / 10 ms framing with 40 log-mel bands, as used for speaker encoding.
    pub fn encoder_16k() -> Self {
        Self {
            sample_rate: 16_000,
            n_fft: 400,
            win_length: 400,
            hop_length: 160,
            n_mels: 40,
            fmin: 0.0,
            fmax: 8_000.0,
            preemphasis: None,
            scale: FeatureScale::LogClamp { floor: 1e-5 },
        }
    }

    /// 50 ms / 12.5 ms framing with 80 symmetric dB bands, as used by the synthesizer.
    pub fn synthesizer_16k() -> Self {
        Self {
            sample_rate: 16_000,
            n_fft: 800,
            win_length: 800,
            hop_length: 200,
            n_mels: 80,
            fmin: 55.0,
            fmax: 7_600.0,
            preemphasis: Some(0.97),
            scale: FeatureScale::SymmetricDb {
                min_level_db: -100.0,
                ref_level_db: 20.0,
                max_abs_value: 4.0,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.hop_length == 0 || self.win_length == 0 {
            return Err(VoiceError::model_load(
                "sample_rate, hop_length and win_length must be non-zero",
            ));
        }
        if self.win_length > self.n_fft {
            return Err(VoiceError::model_load(format!(
                "win_length {} exceeds n_fft {}",
                self.win_length, self.n_fft
            )));
        }
        if self.n_mels == 0 {
            return Err(VoiceError::model_load("n_mels must be non-zero"));
        }
        if !(self.fmin >= 0.0 && self.fmin < self.fmax && self.fmax <= self.sample_rate as f32 / 2.0)
        {
            return Err(VoiceError::model_load(format!(
                "invalid mel band range {}..{} Hz for {} Hz audio",
                self.fmin, self.fmax, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Waveform <-> normalized mel frames.
///
/// Framing has no centering: `frames = floor((n - win) / hop) + 1`, and input
/// shorter than one window is zero-padded on the right to exactly one frame.
pub struct FeatureFrontend {
    config: MelConfig,
    window: Vec<f32>,
    filterbank: Array2<f32>,
    inverse_filterbank: Array2<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
    ifft: Arc<dyn ComplexToReal<f32>>,
}

// Manual Debug implementation since the FFT plans don't implement Debug
impl fmt::Debug for FeatureFrontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureFrontend")
            .field("config", &self.config)
            .field("fft", &"<RealFft>")
            .finish()
    }
}

impl FeatureFrontend {
    pub fn new(config: MelConfig) -> Result<Self> {
        config.validate()?;

        let window = (0..config.win_length)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / config.win_length as f32).cos()
            })
            .collect();
        let filterbank = mel_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_mels,
            config.fmin,
            config.fmax,
        );
        let inverse_filterbank = inverse_filterbank(&filterbank);

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        let ifft = planner.plan_fft_inverse(config.n_fft);

        Ok(Self {
            config,
            window,
            filterbank,
            inverse_filterbank,
            fft,
            ifft,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    pub fn scale(&self) -> FeatureScale {
        self.config.scale
    }

    pub fn n_bins(&self) -> usize {
        self.config.n_fft / 2 + 1
    }

    pub fn frame_count(&self, n_samples: usize) -> usize {
        let win = self.config.win_length;
        match n_samples {
            0 => 0,
            n if n < win => 1,
            n => (n - win) / self.config.hop_length + 1,
        }
    }

    pub fn silence_frame(&self) -> Vec<f32> {
        vec![self.config.scale.silence(); self.config.n_mels]
    }

    /// Resample to the configured rate, then analyze.
    pub fn waveform_to_features(&self, samples: &[f32], sample_rate: u32) -> Result<AcousticFeatures> {
        validate_samples(samples)?;
        let resampled = resample(samples, sample_rate, self.config.sample_rate)?;
        self.analyze(&resampled)
    }

    /// Analyze audio already at the configured sample rate.
    pub fn analyze(&self, samples: &[f32]) -> Result<AcousticFeatures> {
        validate_samples(samples)?;
        let emphasized: Cow<'_, [f32]> = match self.config.preemphasis {
            Some(k) => Cow::Owned(preemphasis(samples, k)),
            None => Cow::Borrowed(samples),
        };

        let scale = self.config.scale;
        let frames = self
            .stft(&emphasized)?
            .into_iter()
            .map(|bins| {
                let magnitudes: Array1<f32> = bins.iter().map(|c| c.norm()).collect();
                self.filterbank
                    .dot(&magnitudes)
                    .iter()
                    .map(|&m| scale.normalize(m))
                    .collect()
            })
            .collect();

        AcousticFeatures::new(frames, self.config.n_mels, scale)
    }

    /// Approximate playback duration of `features` at this frontend's hop.
    pub fn features_to_waveform_hint(&self, features: &AcousticFeatures) -> Duration {
        let samples = features.len() * self.config.hop_length;
        Duration::from_secs_f64(samples as f64 / self.config.sample_rate as f64)
    }

    pub(crate) fn stft(&self, samples: &[f32]) -> Result<Vec<Vec<Complex32>>> {
        let win = self.config.win_length;
        let hop = self.config.hop_length;
        let n_frames = self.frame_count(samples.len());

        let padded: Cow<'_, [f32]> = if samples.len() < win {
            let mut v = samples.to_vec();
            v.resize(win, 0.0);
            Cow::Owned(v)
        } else {
            Cow::Borrowed(samples)
        };

        let mut input = self.fft.make_input_vec();
        let mut output = self.fft.make_output_vec();
        let mut frames = Vec::with_capacity(n_frames);
        for t in 0..n_frames {
            let start = t * hop;
            input.iter_mut().for_each(|v| *v = 0.0);
            for ((dst, &s), &w) in input
                .iter_mut()
                .zip(&padded[start..start + win])
                .zip(&self.window)
            {
                *dst = s * w;
            }
            self.fft
                .process(&mut input, &mut output)
                .map_err(|e| VoiceError::invalid(format!("FFT error: {}", e)))?;
            frames.push(output.clone());
        }
        Ok(frames)
    }

    /// Weighted overlap-add inverse of [`stft`](Self::stft).
    /// Output length is `(frames - 1) * hop + win`.
    pub(crate) fn istft(&self, spectrum: &[Vec<Complex32>]) -> Result<Vec<f32>> {
        if spectrum.is_empty() {
            return Ok(Vec::new());
        }
        let win = self.config.win_length;
        let hop = self.config.hop_length;
        let out_len = (spectrum.len() - 1) * hop + win;
        let mut out = vec![0.0f32; out_len];
        let mut weight = vec![0.0f32; out_len];
        let scale = 1.0 / self.config.n_fft as f32;

        let mut bins = self.ifft.make_input_vec();
        let mut time = self.ifft.make_output_vec();
        let last = bins.len() - 1;
        for (t, frame) in spectrum.iter().enumerate() {
            bins.copy_from_slice(frame);
            bins[0].im = 0.0;
            if self.config.n_fft % 2 == 0 {
                bins[last].im = 0.0;
            }
            self.ifft
                .process(&mut bins, &mut time)
                .map_err(|e| VoiceError::invalid(format!("inverse FFT error: {}", e)))?;

            let start = t * hop;
            for (i, &w) in self.window.iter().enumerate() {
                out[start + i] += time[i] * scale * w;
                weight[start + i] += w * w;
            }
        }
        for (o, &w) in out.iter_mut().zip(&weight) {
            if w > 1e-8 {
                *o /= w;
            }
        }
        Ok(out)
    }

    /// Mel amplitudes -> approximate linear-frequency magnitudes.
    pub(crate) fn mel_to_linear(&self, mel: &Array1<f32>) -> Array1<f32> {
        self.inverse_filterbank.dot(mel).mapv(|v| v.max(1e-10))
    }
}

/// Slaney-normalized triangular filters on the HTK mel scale, shape `(n_mels, n_fft/2 + 1)`.
fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize, fmin: f32, fmax: f32) -> Array2<f32> {
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let n_bins = n_fft / 2 + 1;
    let bin_hz = |k: usize| k as f32 * sample_rate as f32 / n_fft as f32;

    let mut filterbank = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = 2.0 / (right - left);
        for k in 0..n_bins {
            let f = bin_hz(k);
            let rising = (f - left) / (center - left);
            let falling = (right - f) / (right - center);
            filterbank[[m, k]] = rising.min(falling).max(0.0) * enorm;
        }
    }
    filterbank
}

/// Spread each band's average level back over the bins it covers.
fn inverse_filterbank(filterbank: &Array2<f32>) -> Array2<f32> {
    let (n_mels, n_bins) = filterbank.dim();
    let band_mass: Vec<f32> = (0..n_mels).map(|m| filterbank.row(m).sum()).collect();

    let mut inverse = Array2::<f32>::zeros((n_bins, n_mels));
    for k in 0..n_bins {
        let coverage: f32 = filterbank.column(k).sum();
        if coverage <= 0.0 {
            continue;
        }
        for m in 0..n_mels {
            if band_mass[m] > 0.0 {
                inverse[[k, m]] = filterbank[[m, k]] / coverage / band_mass[m];
            }
        }
    }
    inverse
}
