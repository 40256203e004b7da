use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Rejects empty or non-finite sample buffers.
pub fn validate_samples(samples: &[f32]) -> Result<()> {
    if samples.is_empty() {
        return Err(VoiceError::invalid("waveform cannot be empty"));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(VoiceError::invalid("waveform contains non-finite samples"));
    }
    Ok(())
}

pub(crate) fn preemphasis(samples: &[f32], k: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0f32;
    for &s in samples {
        out.push(s - k * prev);
        prev = s;
    }
    out
}

pub(crate) fn deemphasis(samples: &mut [f32], k: f32) {
    let mut prev = 0.0f32;
    for s in samples.iter_mut() {
        *s += k * prev;
        prev = *s;
    }
}

/// Scale `samples` so their mean power sits at `target_dbfs`.
pub fn normalize_volume(samples: &mut [f32], target_dbfs: f32, increase_only: bool) {
    if samples.is_empty() {
        return;
    }
    let mean_power = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    if mean_power <= 1e-20 {
        return;
    }
    let change_db = target_dbfs - 10.0 * mean_power.log10();
    if change_db < 0.0 && increase_only {
        return;
    }
    let gain = 10f32.powf(change_db / 20.0);
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// Energy-gated voice activity settings for [`trim_long_silences`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub window_ms: u32,
    /// Windows quieter than this (dBFS, RMS) count as silence.
    pub energy_threshold_db: f32,
    pub moving_average_width: usize,
    /// Silent runs up to this many windows survive between voiced regions.
    pub max_silence_windows: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            window_ms: 30,
            energy_threshold_db: -45.0,
            moving_average_width: 8,
            max_silence_windows: 6,
        }
    }
}

/// Drop silent stretches longer than `max_silence_windows`.
///
/// Output length is a multiple of the analysis window; everything past the
/// last full window is discarded.
pub fn trim_long_silences(samples: &[f32], sample_rate: u32, config: &VadConfig) -> Vec<f32> {
    let window = ((config.window_ms as usize * sample_rate as usize) / 1000).max(1);
    let n_windows = samples.len() / window;
    if n_windows == 0 {
        return samples.to_vec();
    }

    let flags: Vec<f32> = samples
        .chunks_exact(window)
        .map(|w| {
            let rms = (w.iter().map(|s| s * s).sum::<f32>() / w.len() as f32).sqrt();
            if 20.0 * rms.max(1e-10).log10() > config.energy_threshold_db {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    let smoothed = moving_average(&flags, config.moving_average_width.max(1));
    let voiced: Vec<bool> = smoothed.iter().map(|&v| v >= 0.5).collect();

    let reach = config.max_silence_windows / 2;
    let mut mask = vec![false; n_windows];
    for (i, &v) in voiced.iter().enumerate() {
        if v {
            let lo = i.saturating_sub(reach);
            let hi = (i + reach + 1).min(n_windows);
            mask[lo..hi].iter_mut().for_each(|m| *m = true);
        }
    }

    samples
        .chunks_exact(window)
        .zip(mask)
        .filter(|(_, keep)| *keep)
        .flat_map(|(w, _)| w.iter().copied())
        .collect()
}

fn moving_average(values: &[f32], width: usize) -> Vec<f32> {
    let half = width / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + width - half).min(values.len());
            values[lo..hi].iter().sum::<f32>() / width as f32
        })
        .collect()
}
