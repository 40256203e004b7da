use rubato::{FftFixedIn, Resampler};

use crate::error::{Result, VoiceError};

const CHUNK_SIZE: usize = 1024;

/// Resample mono audio. Output length is `ceil(len * to / from)`.
pub fn resample(samples: &[f32], from_sr: u32, to_sr: u32) -> Result<Vec<f32>> {
    if from_sr == 0 || to_sr == 0 {
        return Err(VoiceError::invalid(format!(
            "invalid sample rate conversion {} -> {}",
            from_sr, to_sr
        )));
    }
    if from_sr == to_sr || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from_sr as usize, to_sr as usize, CHUNK_SIZE, 2, 1)
        .map_err(|e| VoiceError::invalid(format!("failed to create resampler: {}", e)))?;

    let expected = (samples.len() as u64 * to_sr as u64).div_ceil(from_sr as u64) as usize;

    // The FFT resampler may round the requested chunk size
    let chunk_size = resampler.input_frames_next();
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + 2 * chunk_size);
    for chunk in samples.chunks(chunk_size) {
        let block = [chunk];
        let mut resampled = if chunk.len() == chunk_size {
            resampler.process(&block, None)
        } else {
            resampler.process_partial(Some(&block), None)
        }
        .map_err(|e| VoiceError::invalid(format!("resample error: {}", e)))?;
        output.append(&mut resampled[0]);
    }

    // Flush with silence until the delayed tail is out
    while output.len() < expected + delay {
        let mut resampled = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| VoiceError::invalid(format!("resample error: {}", e)))?;
        if resampled[0].is_empty() {
            break;
        }
        output.append(&mut resampled[0]);
    }

    // Drop the filter delay so samples keep their time position
    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    output.resize(expected, 0.0);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_passthrough() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let samples = vec![0.0f32; 44_100];
        let out = resample(&samples, 44_100, 16_000).unwrap();
        assert_eq!(out.len(), 16_000);

        let samples = vec![0.0f32; 1000];
        let out = resample(&samples, 8_000, 16_000).unwrap();
        assert_eq!(out.len(), 2000);
    }

    fn peak_index(samples: &[f32]) -> usize {
        samples
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |(bi, bv), (i, &v)| if v.abs() > bv { (i, v.abs()) } else { (bi, bv) })
            .0
    }

    #[test]
    fn test_impulse_keeps_its_time_position() {
        let mut samples = vec![0.0f32; 4000];
        samples[1000] = 1.0;

        let up = resample(&samples, 8_000, 16_000).unwrap();
        assert!((peak_index(&up) as i64 - 2000).abs() < 8, "peak at {}", peak_index(&up));

        let down = resample(&samples, 8_000, 4_000).unwrap();
        assert!((peak_index(&down) as i64 - 500).abs() < 4, "peak at {}", peak_index(&down));
    }

    #[test]
    fn test_tail_survives_resampling() {
        // A tone running to the last sample must still be audible at the end
        let samples: Vec<f32> = (0..3000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 8_000.0).sin())
            .collect();
        let out = resample(&samples, 8_000, 16_000).unwrap();
        let tail = &out[out.len() - 400..out.len() - 50];
        let rms = (tail.iter().map(|v| v * v).sum::<f32>() / tail.len() as f32).sqrt();
        assert!(rms > 0.2, "tail rms {}", rms);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(resample(&[0.0], 0, 16_000).is_err());
    }
}
