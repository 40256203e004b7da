use ndarray::Array1;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::mel::FeatureFrontend;
use super::signal::deemphasis;
use crate::error::Result;
use crate::types::{AcousticFeatures, Waveform};

/// Phase reconstruction settings for model-free inversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GriffinLimConfig {
    pub iterations: usize,
    /// Magnitudes are raised to this power before inversion to sharpen harmonics.
    pub power: f32,
    pub seed: u64,
}

impl Default for GriffinLimConfig {
    fn default() -> Self {
        Self {
            iterations: 32,
            power: 1.5,
            seed: 0,
        }
    }
}

impl FeatureFrontend {
    /// Approximate waveform for `features` via Griffin-Lim.
    ///
    /// Output holds exactly `frames * hop` samples so it lines up with
    /// vocoder output for the same features.
    pub fn invert(&self, features: &AcousticFeatures, config: &GriffinLimConfig) -> Result<Waveform> {
        let sample_rate = self.config().sample_rate;
        let target_len = features.len() * self.config().hop_length;
        if features.is_empty() {
            return Ok(Waveform::new(Vec::new(), sample_rate));
        }

        let scale = features.scale();
        let magnitudes: Vec<Array1<f32>> = features
            .frames()
            .iter()
            .map(|frame| {
                let mel: Array1<f32> = frame.iter().map(|&v| scale.denormalize(v)).collect();
                self.mel_to_linear(&mel).mapv(|m| m.powf(config.power))
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut spectrum: Vec<Vec<Complex32>> = magnitudes
            .iter()
            .map(|mags| {
                mags.iter()
                    .map(|&m| {
                        let phase = rng.gen_range(0.0..std::f32::consts::TAU);
                        Complex32::from_polar(m, phase)
                    })
                    .collect()
            })
            .collect();

        let mut signal = self.istft(&spectrum)?;
        for _ in 0..config.iterations {
            let estimate = self.stft(&signal)?;
            for ((frame, est), mags) in spectrum.iter_mut().zip(&estimate).zip(&magnitudes) {
                for ((bin, e), &m) in frame.iter_mut().zip(est).zip(mags.iter()) {
                    let norm = e.norm();
                    *bin = if norm > 1e-8 {
                        *e * (m / norm)
                    } else {
                        Complex32::new(m, 0.0)
                    };
                }
            }
            signal = self.istft(&spectrum)?;
        }

        if let Some(k) = self.config().preemphasis {
            deemphasis(&mut signal, k);
        }
        signal.resize(target_len, 0.0);
        tracing::debug!(
            frames = features.len(),
            iterations = config.iterations,
            "Griffin-Lim inversion complete"
        );
        Ok(Waveform::new(signal, sample_rate))
    }
}
