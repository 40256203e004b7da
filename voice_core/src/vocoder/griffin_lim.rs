use crate::error::{Result, VoiceError};
use crate::frontend::{FeatureFrontend, GriffinLimConfig, MelConfig};
use crate::traits::Vocodable;
use crate::types::AcousticFeatures;

/// Model-free vocoder built on the frontend's Griffin-Lim inversion.
///
/// Useful for checking a synthesizer without vocoder weights. Phase
/// reconstruction runs over the whole utterance, so windowed renders differ
/// from the batch render and streaming is refused.
#[derive(Debug)]
pub struct GriffinLimVocoder {
    frontend: FeatureFrontend,
    config: GriffinLimConfig,
}

impl GriffinLimVocoder {
    pub fn new(mel: MelConfig, config: GriffinLimConfig) -> Result<Self> {
        Ok(Self {
            frontend: FeatureFrontend::new(mel)?,
            config,
        })
    }
}

impl Vocodable for GriffinLimVocoder {
    fn sample_rate(&self) -> u32 {
        self.frontend.config().sample_rate
    }

    fn hop_length(&self) -> usize {
        self.frontend.config().hop_length
    }

    fn n_mels(&self) -> usize {
        self.frontend.config().n_mels
    }

    fn context_frames(&self) -> usize {
        let mel = self.frontend.config();
        mel.win_length.div_ceil(mel.hop_length) + 1
    }

    fn supports_streaming(&self) -> bool {
        false
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
        let hop = self.hop_length();
        if start == end {
            return Ok(Vec::new());
        }

        let context = self.context_frames();
        let lo = start.saturating_sub(context);
        let hi = (end + context).min(frames.len());
        let features = AcousticFeatures::new(
            frames[lo..hi].to_vec(),
            self.n_mels(),
            self.frontend.scale(),
        )?;
        let wav = self.frontend.invert(&features, &self.config)?;

        let offset = (start - lo) * hop;
        let mut out: Vec<f32> = wav
            .samples()
            .iter()
            .skip(offset)
            .take((end - start) * hop)
            .copied()
            .collect();
        out.resize((end - start) * hop, 0.0);
        Ok(out)
    }
}
