//! Capability traits separating the orchestrator from model families.
//!
//! Any encoder, synthesizer or vocoder can back a [`VoicePipeline`](crate::VoicePipeline)
//! as long as the dimensions it reports agree with its neighbours.

use crate::cancel::CancelToken;
use crate::error::{Result, VoiceError};
use crate::frontend::FeatureScale;
use crate::synthesizer::SynthesisReport;
use crate::text::TextSequence;
use crate::types::{AcousticFeatures, SpeakerEmbedding, Waveform};

pub trait Embeddable: Send + Sync {
    /// Rate the encoder analyses at; other rates are resampled.
    fn sample_rate(&self) -> u32;

    fn embedding_dim(&self) -> usize;

    fn embed(&self, samples: &[f32], sample_rate: u32) -> Result<SpeakerEmbedding>;
}

pub trait Synthesizable: Send + Sync {
    fn n_mels(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    /// Sample rate of the audio the produced frames describe.
    fn sample_rate(&self) -> u32;

    fn hop_length(&self) -> usize;

    fn scale(&self) -> FeatureScale;

    /// Decode `tokens`, handing each frame to `sink` as soon as it exists.
    ///
    /// An error from `sink` aborts decoding and is returned unchanged.
    fn synthesize_into(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(Vec<f32>) -> Result<()>,
    ) -> Result<SynthesisReport>;

    fn synthesize(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
    ) -> Result<AcousticFeatures> {
        let mut features = AcousticFeatures::empty(self.n_mels(), self.scale());
        let cancel = CancelToken::new();
        self.synthesize_into(tokens, embedding, &cancel, &mut |frame| features.push(frame))?;
        Ok(features)
    }
}

pub trait Vocodable: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn hop_length(&self) -> usize;

    fn n_mels(&self) -> usize;

    /// Frames needed on each side of a range for [`render`](Self::render) to
    /// match a full-sequence render exactly.
    fn context_frames(&self) -> usize;

    /// Samples `[start * hop, end * hop)` of the waveform for `frames`.
    ///
    /// Only frames within `context_frames` of the range are read, so `frames`
    /// may be a prefix of the full sequence as long as it reaches
    /// `end + context_frames` or is complete.
    fn render(&self, frames: &[Vec<f32>], start: usize, end: usize) -> Result<Vec<f32>>;

    /// Whether windowed renders reproduce the full-sequence render. A vocoder
    /// whose output depends on the whole utterance returns `false` and is
    /// refused for streamed delivery.
    fn supports_streaming(&self) -> bool {
        true
    }

    fn vocode(&self, features: &AcousticFeatures) -> Result<Waveform> {
        if features.n_mels() != self.n_mels() {
            return Err(VoiceError::invalid(format!(
                "vocoder expects {} mel bands, got {}",
                self.n_mels(),
                features.n_mels()
            )));
        }
        let samples = self.render(features.frames(), 0, features.len())?;
        Ok(Waveform::new(samples, self.sample_rate()))
    }
}
