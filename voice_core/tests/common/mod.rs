//! Shared stub models and tiny seeded configurations for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use voice_core::{
    CancelToken, DecodePolicy, Embeddable, EncoderConfig, EncoderParams, FeatureScale, MelConfig,
    NeuralSynthesizer, NeuralVocoder, PipelineConfig, Result, SpeakerEmbedding, SpeakerEncoder,
    StreamWindowing, SynthesisReport, Synthesizable, SynthesizerConfig, SynthesizerParams,
    TextSequence, VocoderConfig, VocoderParams, VoiceError, VoicePipeline, Waveform,
};

pub const SAMPLE_RATE: u32 = 16_000;
pub const N_MELS: usize = 10;
pub const HOP: usize = 200;
pub const EMBEDDING_DIM: usize = 8;

pub fn tiny_mel() -> MelConfig {
    MelConfig {
        n_mels: N_MELS,
        ..MelConfig::synthesizer_16k()
    }
}

pub fn tiny_encoder_config() -> EncoderConfig {
    EncoderConfig {
        hidden_size: 12,
        num_layers: 2,
        embedding_dim: EMBEDDING_DIM,
        final_relu: false,
        trim_silence: None,
        ..Default::default()
    }
}

pub fn tiny_encoder() -> SpeakerEncoder {
    let config = tiny_encoder_config();
    let params = EncoderParams::random(&config, 17);
    SpeakerEncoder::new(config, params).unwrap()
}

pub fn tiny_synth_config() -> SynthesizerConfig {
    SynthesizerConfig {
        mel: tiny_mel(),
        vocab_size: 16,
        token_dim: 6,
        encoder_layers: 1,
        encoder_kernel: 3,
        speaker_dim: EMBEDDING_DIM,
        prenet_dims: vec![8],
        decoder_dim: 10,
        attention_dim: 6,
        location_filters: 3,
        location_kernel: 5,
    }
}

/// Real synthesizer whose stop logit is pinned to `stop_bias`.
pub fn tiny_synthesizer(stop_bias: f32, policy: DecodePolicy) -> NeuralSynthesizer {
    let config = tiny_synth_config();
    let mut params = SynthesizerParams::random(&config, 23);
    params.stop_proj.weight.fill(0.0);
    params.stop_proj.bias.fill(stop_bias);
    NeuralSynthesizer::new(config, params, policy).unwrap()
}

/// Real synthesizer with flat attention: every step attends the first token
/// most, and the stop token fires after `stop_debounce` steps.
pub fn stalled_attention_synthesizer() -> NeuralSynthesizer {
    let config = tiny_synth_config();
    let mut params = SynthesizerParams::random(&config, 23);
    params.attention.energy.weight.fill(0.0);
    params.attention.energy.bias.fill(0.0);
    params.stop_proj.weight.fill(0.0);
    params.stop_proj.bias.fill(8.0);
    NeuralSynthesizer::new(config, params, DecodePolicy::default()).unwrap()
}

pub fn tiny_vocoder_config() -> VocoderConfig {
    VocoderConfig {
        mel: tiny_mel(),
        channels: 6,
        layers: 2,
        kernel: 3,
    }
}

pub fn tiny_vocoder() -> NeuralVocoder {
    let config = tiny_vocoder_config();
    let params = VocoderParams::random(&config, 29);
    NeuralVocoder::new(config, params).unwrap()
}

pub fn small_windows() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.streaming.windowing = StreamWindowing {
        window_frames: 8,
        overlap_frames: 2,
        context_frames: None,
    };
    config.streaming.frame_queue_capacity = 4;
    config.streaming.chunk_queue_capacity = 2;
    config
}

/// Harmonic "voice" with a slow vibrato.
pub fn voice(seconds: f32, f0: f32) -> Waveform {
    let n = (seconds * SAMPLE_RATE as f32) as usize;
    let samples = (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let pitch = f0 * (1.0 + 0.02 * (2.0 * std::f32::consts::PI * 5.0 * t).sin());
            (1..8)
                .map(|h| 0.25 / h as f32 * (2.0 * std::f32::consts::PI * pitch * h as f32 * t).sin())
                .sum()
        })
        .collect();
    Waveform::new(samples, SAMPLE_RATE)
}

/// Encoder stub that counts invocations and derives a vector from simple statistics.
#[derive(Debug, Default)]
pub struct CountingEncoder {
    pub calls: AtomicUsize,
}

impl CountingEncoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embeddable for CountingEncoder {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, samples: &[f32], sample_rate: u32) -> Result<SpeakerEmbedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let secs = samples.len() as f32 / sample_rate as f32;
        if secs < 0.5 {
            return Err(VoiceError::InsufficientAudio {
                duration_secs: secs,
                min_secs: 0.5,
            });
        }
        let energy = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        let raw = (0..EMBEDDING_DIM).map(|i| 1.0 + energy * (i as f32 + 1.0)).collect();
        SpeakerEmbedding::from_raw(raw)
    }
}

/// Lets a test hold a synthesizer after a given number of frames.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self, cancel: &CancelToken) {
        let mut open = self.open.lock().unwrap();
        while !*open && !cancel.is_cancelled() {
            open = self.cv.wait_timeout(open, Duration::from_millis(5)).unwrap().0;
        }
    }
}

/// Synthesizer stub producing a deterministic frame sequence.
///
/// `frames_per_segment: None` never stops and fails with `AlignmentFailure`
/// after `max_steps`, like a model whose stop token never fires.
#[derive(Debug)]
pub struct ScriptedSynthesizer {
    pub frames_per_segment: Option<usize>,
    pub max_steps: usize,
    pub frame_delay: Duration,
    pub gate_after: Option<(usize, Arc<Gate>)>,
    pub frames_emitted: AtomicUsize,
}

impl ScriptedSynthesizer {
    pub fn new(frames_per_segment: Option<usize>) -> Self {
        Self {
            frames_per_segment,
            max_steps: 1000,
            frame_delay: Duration::ZERO,
            gate_after: None,
            frames_emitted: AtomicUsize::new(0),
        }
    }

    pub fn emitted(&self) -> usize {
        self.frames_emitted.load(Ordering::SeqCst)
    }

    pub fn frame(seed: u32, step: usize) -> Vec<f32> {
        (0..N_MELS)
            .map(|m| (((seed as usize + step * 5 + m * 3) % 13) as f32) * 0.5 - 3.0)
            .collect()
    }
}

impl Synthesizable for ScriptedSynthesizer {
    fn n_mels(&self) -> usize {
        N_MELS
    }

    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn hop_length(&self) -> usize {
        HOP
    }

    fn scale(&self) -> FeatureScale {
        tiny_mel().scale
    }

    fn synthesize_into(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(Vec<f32>) -> Result<()>,
    ) -> Result<SynthesisReport> {
        tokens.validate(16)?;
        if embedding.dim() != EMBEDDING_DIM {
            return Err(VoiceError::invalid("wrong embedding size"));
        }
        let seed: u32 = tokens.tokens().iter().sum();
        let limit = self.frames_per_segment.unwrap_or(usize::MAX).min(self.max_steps);
        for step in 0..limit {
            cancel.check()?;
            if let Some((after, gate)) = &self.gate_after {
                if self.emitted() == *after {
                    gate.wait(cancel);
                    cancel.check()?;
                }
            }
            sink(Self::frame(seed, step))?;
            self.frames_emitted.fetch_add(1, Ordering::SeqCst);
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
        }
        if self.frames_per_segment.is_none() {
            return Err(VoiceError::alignment(self.max_steps, "stop token never fired"));
        }
        Ok(SynthesisReport {
            steps: limit,
            ..Default::default()
        })
    }
}

pub fn stub_pipeline(
    synthesizer: ScriptedSynthesizer,
    config: PipelineConfig,
) -> (VoicePipeline, Arc<CountingEncoder>, Arc<ScriptedSynthesizer>) {
    let encoder = Arc::new(CountingEncoder::default());
    let synthesizer = Arc::new(synthesizer);
    let pipeline = VoicePipeline::from_parts(
        encoder.clone(),
        synthesizer.clone(),
        Arc::new(tiny_vocoder()),
        config,
    )
    .unwrap();
    (pipeline, encoder, synthesizer)
}
