// WAV <-> base64 conversion for the HTTP surface

use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use voice_core::Waveform;

use crate::error::ApiError;

/// Decode a base64 WAV file into a mono waveform. Multi-channel input is averaged.
pub fn decode_wav_base64(data: &str) -> Result<Waveform, ApiError> {
    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ApiError::InvalidInput(format!("Reference is not valid base64: {e}")))?;
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| ApiError::InvalidInput(format!("Reference is not a WAV file: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| ApiError::InvalidInput(format!("Corrupt WAV data: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| ApiError::InvalidInput(format!("Corrupt WAV data: {e}")))?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok(Waveform::new(samples, spec.sample_rate))
}

/// Encode as 16-bit mono PCM WAV, base64.
pub fn encode_wav_base64(wav: &Waveform) -> Result<String, ApiError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: wav.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // WAV header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + wav.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ApiError::InternalError(format!("WAV write error: {e}")))?;
        for &s in wav.samples() {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(v)
                .map_err(|e| ApiError::InternalError(format!("WAV sample error: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ApiError::InternalError(format!("WAV finalize error: {e}")))?;
    }
    Ok(general_purpose::STANDARD.encode(cursor.into_inner()))
}
