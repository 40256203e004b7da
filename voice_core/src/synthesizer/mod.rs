//! Text + speaker embedding -> mel frames.
//!
//! An attention-based autoregressive decoder: each step consumes the previous
//! frame, attends over the encoded tokens, and emits one frame plus a stop
//! logit. Decoding state lives in a per-call `DecodeSession`.

mod alignment;
mod attention;

pub use alignment::{AlignmentState, DecodePhase, MonotonicityPolicy};
pub use attention::LocationAttention;

use ndarray::{s, Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{Result, VoiceError};
use crate::frontend::{FeatureScale, MelConfig};
use crate::nn::{relu_inplace, sigmoid, Conv1d, Embedding, Linear, LstmCell, LstmState};
use crate::text::TextSequence;
use crate::traits::Synthesizable;
use crate::types::SpeakerEmbedding;

/// Stop and alignment rules, tunable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodePolicy {
    pub stop_threshold: f32,
    /// Consecutive steps above the threshold needed to stop.
    pub stop_debounce: usize,
    pub max_decoder_steps: usize,
    /// Backward focus movement, in tokens, tolerated without a violation.
    pub backward_tolerance: usize,
    /// A stop before attention reaches the last `end_tolerance` tokens is premature.
    pub end_tolerance: usize,
    pub monotonicity: MonotonicityPolicy,
}

impl Default for DecodePolicy {
    fn default() -> Self {
        Self {
            stop_threshold: 0.5,
            stop_debounce: 3,
            max_decoder_steps: 1000,
            backward_tolerance: 2,
            end_tolerance: 2,
            monotonicity: MonotonicityPolicy::Warn,
        }
    }
}

impl DecodePolicy {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.stop_threshold) {
            return Err(VoiceError::model_load(format!(
                "stop_threshold {} must be in [0, 1)",
                self.stop_threshold
            )));
        }
        if self.stop_debounce == 0 || self.max_decoder_steps == 0 {
            return Err(VoiceError::model_load(
                "stop_debounce and max_decoder_steps must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    /// Framing of the audio the frames describe; must match the vocoder.
    pub mel: MelConfig,
    pub vocab_size: usize,
    pub token_dim: usize,
    pub encoder_layers: usize,
    pub encoder_kernel: usize,
    pub speaker_dim: usize,
    pub prenet_dims: Vec<usize>,
    pub decoder_dim: usize,
    pub attention_dim: usize,
    pub location_filters: usize,
    pub location_kernel: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            mel: MelConfig::synthesizer_16k(),
            vocab_size: 66,
            token_dim: 512,
            encoder_layers: 3,
            encoder_kernel: 5,
            speaker_dim: 256,
            prenet_dims: vec![256, 256],
            decoder_dim: 1024,
            attention_dim: 128,
            location_filters: 32,
            location_kernel: 31,
        }
    }
}

impl SynthesizerConfig {
    pub fn memory_dim(&self) -> usize {
        self.token_dim + self.speaker_dim
    }

    fn prenet_out(&self) -> usize {
        self.prenet_dims.last().copied().unwrap_or(self.mel.n_mels)
    }

    pub fn validate(&self) -> Result<()> {
        self.mel.validate()?;
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("token_dim", self.token_dim),
            ("speaker_dim", self.speaker_dim),
            ("decoder_dim", self.decoder_dim),
            ("attention_dim", self.attention_dim),
            ("location_filters", self.location_filters),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(VoiceError::model_load(format!("synthesizer {} must be non-zero", name)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizerParams {
    pub embedding: Embedding,
    pub encoder_convs: Vec<Conv1d>,
    pub prenet: Vec<Linear>,
    pub decoder: LstmCell,
    pub attention: LocationAttention,
    pub frame_proj: Linear,
    pub stop_proj: Linear,
}

impl SynthesizerParams {
    pub fn random(config: &SynthesizerConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let embedding = Embedding::random(&mut rng, config.vocab_size, config.token_dim);
        let encoder_convs = (0..config.encoder_layers)
            .map(|_| Conv1d::random(&mut rng, config.token_dim, config.token_dim, config.encoder_kernel))
            .collect();

        let mut prenet = Vec::with_capacity(config.prenet_dims.len());
        let mut input = config.mel.n_mels;
        for &dim in &config.prenet_dims {
            prenet.push(Linear::random(&mut rng, input, dim));
            input = dim;
        }

        let memory_dim = config.memory_dim();
        let decoder = LstmCell::random(&mut rng, config.prenet_out() + memory_dim, config.decoder_dim);
        let attention = LocationAttention::random(
            &mut rng,
            config.decoder_dim,
            memory_dim,
            config.attention_dim,
            config.location_filters,
            config.location_kernel,
        );
        let frame_proj = Linear::random(&mut rng, config.decoder_dim + memory_dim, config.mel.n_mels);
        let stop_proj = Linear::random(&mut rng, config.decoder_dim + memory_dim, 1);

        Self {
            embedding,
            encoder_convs,
            prenet,
            decoder,
            attention,
            frame_proj,
            stop_proj,
        }
    }

    fn check(&self, config: &SynthesizerConfig) -> Result<()> {
        self.embedding.check("embedding", config.vocab_size, config.token_dim)?;
        if self.encoder_convs.len() != config.encoder_layers {
            return Err(VoiceError::model_load(format!(
                "synthesizer has {} encoder convolutions, config expects {}",
                self.encoder_convs.len(),
                config.encoder_layers
            )));
        }
        for (i, conv) in self.encoder_convs.iter().enumerate() {
            conv.check(
                &format!("encoder_convs.{}", i),
                config.token_dim,
                config.token_dim,
                config.encoder_kernel,
            )?;
        }
        if self.prenet.len() != config.prenet_dims.len() {
            return Err(VoiceError::model_load("prenet depth does not match config"));
        }
        let mut input = config.mel.n_mels;
        for (i, (layer, &dim)) in self.prenet.iter().zip(&config.prenet_dims).enumerate() {
            layer.check(&format!("prenet.{}", i), input, dim)?;
            input = dim;
        }

        let memory_dim = config.memory_dim();
        self.decoder
            .check("decoder", config.prenet_out() + memory_dim, config.decoder_dim)?;
        self.attention.check(
            config.decoder_dim,
            memory_dim,
            config.attention_dim,
            config.location_filters,
            config.location_kernel,
        )?;
        self.frame_proj
            .check("frame_proj", config.decoder_dim + memory_dim, config.mel.n_mels)?;
        self.stop_proj.check("stop_proj", config.decoder_dim + memory_dim, 1)
    }
}

fn concat(a: &Array1<f32>, b: &Array1<f32>) -> Array1<f32> {
    a.iter().chain(b.iter()).copied().collect()
}

/// Outcome of one decoding run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisReport {
    pub steps: usize,
    /// Stop fired before attention reached the end of the input.
    pub premature_stop: bool,
    pub monotonicity_violations: usize,
    pub final_focus: usize,
}

/// Mutable state threaded through the decode loop.
#[derive(Debug)]
struct DecodeSession {
    phase: DecodePhase,
    alignment: AlignmentState,
    lstm: LstmState,
    context: Array1<f32>,
    last_frame: Array1<f32>,
    stop_streak: usize,
}

impl DecodeSession {
    fn new(n_tokens: usize, n_mels: usize, decoder_dim: usize, memory_dim: usize) -> Self {
        Self {
            phase: DecodePhase::Idle,
            alignment: AlignmentState::new(n_tokens),
            lstm: LstmState::zeros(decoder_dim),
            context: Array1::zeros(memory_dim),
            last_frame: Array1::zeros(n_mels),
            stop_streak: 0,
        }
    }
}

#[derive(Debug)]
pub struct NeuralSynthesizer {
    config: SynthesizerConfig,
    params: SynthesizerParams,
    policy: DecodePolicy,
}

impl NeuralSynthesizer {
    pub fn new(config: SynthesizerConfig, params: SynthesizerParams, policy: DecodePolicy) -> Result<Self> {
        config.validate()?;
        policy.validate()?;
        params.check(&config)?;
        tracing::info!(
            vocab = config.vocab_size,
            n_mels = config.mel.n_mels,
            max_steps = policy.max_decoder_steps,
            "Synthesizer ready"
        );
        Ok(Self {
            config,
            params,
            policy,
        })
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    pub fn policy(&self) -> &DecodePolicy {
        &self.policy
    }

    /// Replace the decode policy, e.g. after applying environment overrides.
    pub fn with_policy(mut self, policy: DecodePolicy) -> Result<Self> {
        policy.validate()?;
        self.policy = policy;
        Ok(self)
    }

    /// Encoded tokens with the speaker embedding appended to every position.
    fn encode(&self, tokens: &TextSequence, embedding: &SpeakerEmbedding) -> Array2<f32> {
        let mut x = self.params.embedding.lookup(tokens.tokens());
        for conv in &self.params.encoder_convs {
            x = conv.forward(x.view());
            relu_inplace(&mut x);
        }
        let speaker = ndarray::ArrayView1::from(embedding.as_slice());
        let token_dim = x.ncols();
        let mut memory = Array2::<f32>::zeros((x.nrows(), token_dim + speaker.len()));
        memory.slice_mut(s![.., ..token_dim]).assign(&x);
        for mut row in memory.slice_mut(s![.., token_dim..]).rows_mut() {
            row.assign(&speaker);
        }
        memory
    }

    fn step(
        &self,
        session: &mut DecodeSession,
        memory: &Array2<f32>,
        processed_memory: &Array2<f32>,
        step: usize,
    ) -> Result<(Array1<f32>, f32)> {
        let mut x = session.last_frame.clone();
        for layer in &self.params.prenet {
            x = layer.forward(x.view());
            relu_inplace(&mut x);
        }
        let lstm_in = concat(&x, &session.context);
        session.lstm = self.params.decoder.step(lstm_in.view(), &session.lstm);

        let weights = self.params.attention.weights(
            session.lstm.h.view(),
            processed_memory,
            &session.alignment.previous,
            &session.alignment.cumulative,
        );
        session.context = weights.dot(memory);
        session.alignment.update(
            weights,
            step,
            self.policy.backward_tolerance,
            self.policy.monotonicity,
        )?;

        let proj_in = concat(&session.lstm.h, &session.context);
        let scale = self.config.mel.scale;
        let frame = self.params.frame_proj.forward(proj_in.view());
        if frame.iter().any(|v| !v.is_finite()) {
            return Err(VoiceError::alignment(step + 1, "decoder produced a non-finite frame"));
        }
        let frame = frame.mapv(|v| scale.clamp(v));
        let stop = sigmoid(self.params.stop_proj.forward(proj_in.view())[0]);
        Ok((frame, stop))
    }
}

impl Synthesizable for NeuralSynthesizer {
    fn n_mels(&self) -> usize {
        self.config.mel.n_mels
    }

    fn embedding_dim(&self) -> usize {
        self.config.speaker_dim
    }

    fn sample_rate(&self) -> u32 {
        self.config.mel.sample_rate
    }

    fn hop_length(&self) -> usize {
        self.config.mel.hop_length
    }

    fn scale(&self) -> FeatureScale {
        self.config.mel.scale
    }

    fn synthesize_into(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(Vec<f32>) -> Result<()>,
    ) -> Result<SynthesisReport> {
        tokens.validate(self.config.vocab_size)?;
        if embedding.dim() != self.config.speaker_dim {
            return Err(VoiceError::invalid(format!(
                "speaker embedding has {} dimensions, synthesizer expects {}",
                embedding.dim(),
                self.config.speaker_dim
            )));
        }

        let memory = self.encode(tokens, embedding);
        let processed_memory = self.params.attention.process_memory(&memory);
        let mut session = DecodeSession::new(
            tokens.len(),
            self.config.mel.n_mels,
            self.config.decoder_dim,
            self.config.memory_dim(),
        );

        let policy = &self.policy;
        for step in 0..policy.max_decoder_steps {
            session.phase = DecodePhase::Decoding { step };
            if let Err(e) = cancel.check() {
                session.phase = DecodePhase::Aborted;
                tracing::debug!(step, "Decoding cancelled");
                return Err(e);
            }

            let (frame, stop) = match self.step(&mut session, &memory, &processed_memory, step) {
                Ok(out) => out,
                Err(e) => {
                    session.phase = DecodePhase::Aborted;
                    tracing::warn!(step, error = %e, "Decoding aborted");
                    return Err(e);
                }
            };

            session.last_frame = frame.clone();
            if let Err(e) = sink(frame.to_vec()) {
                session.phase = DecodePhase::Aborted;
                return Err(e);
            }

            if stop > policy.stop_threshold {
                session.stop_streak += 1;
            } else {
                session.stop_streak = 0;
            }

            if session.stop_streak >= policy.stop_debounce {
                let steps = step + 1;
                session.phase = DecodePhase::Completed { steps };
                let alignment = &session.alignment;
                let premature_stop = !alignment.reached_end(policy.end_tolerance);
                if premature_stop {
                    tracing::warn!(
                        steps,
                        furthest = alignment.furthest,
                        tokens = alignment.n_tokens(),
                        "Stop fired before attention reached the end of the input"
                    );
                }
                tracing::debug!(phase = ?session.phase, tokens = tokens.len(), "Decoding completed");
                return Ok(SynthesisReport {
                    steps,
                    premature_stop,
                    monotonicity_violations: alignment.violations,
                    final_focus: alignment.focus,
                });
            }
        }

        session.phase = DecodePhase::Aborted;
        tracing::warn!(
            phase = ?session.phase,
            max_steps = policy.max_decoder_steps,
            "Stop token never fired, aborting"
        );
        Err(VoiceError::alignment(
            policy.max_decoder_steps,
            "stop token never fired",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> SynthesizerConfig {
        SynthesizerConfig {
            mel: MelConfig {
                n_mels: 10,
                ..MelConfig::synthesizer_16k()
            },
            vocab_size: 12,
            token_dim: 6,
            encoder_layers: 2,
            encoder_kernel: 3,
            speaker_dim: 4,
            prenet_dims: vec![8, 8],
            decoder_dim: 10,
            attention_dim: 6,
            location_filters: 3,
            location_kernel: 5,
        }
    }

    fn with_stop_bias(bias: f32, policy: DecodePolicy) -> NeuralSynthesizer {
        let config = tiny_config();
        let mut params = SynthesizerParams::random(&config, 42);
        params.stop_proj.weight.fill(0.0);
        params.stop_proj.bias.fill(bias);
        NeuralSynthesizer::new(config, params, policy).unwrap()
    }

    fn speaker() -> SpeakerEmbedding {
        SpeakerEmbedding::from_raw(vec![0.5, -0.2, 0.1, 0.8]).unwrap()
    }

    #[test]
    fn test_stops_after_debounce() {
        let synth = with_stop_bias(8.0, DecodePolicy::default());
        let tokens = TextSequence::new(vec![1, 2, 3, 4]);
        let features = synth.synthesize(&tokens, &speaker()).unwrap();
        // Frames emitted during the debounce window are kept
        assert_eq!(features.len(), 3);
        assert_eq!(features.n_mels(), 10);
        assert!(features
            .frames()
            .iter()
            .flatten()
            .all(|v| (-4.0..=4.0).contains(v)));
    }

    #[test]
    fn test_never_stopping_model_fails_alignment() {
        let policy = DecodePolicy {
            max_decoder_steps: 40,
            ..Default::default()
        };
        let synth = with_stop_bias(-8.0, policy);
        let tokens = TextSequence::new(vec![1, 2, 3]);
        let mut frames = 0;
        let err = synth
            .synthesize_into(&tokens, &speaker(), &CancelToken::new(), &mut |_| {
                frames += 1;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, VoiceError::alignment(40, "stop token never fired"));
        assert_eq!(frames, 40);
    }

    #[test]
    fn test_invalid_inputs() {
        let synth = with_stop_bias(8.0, DecodePolicy::default());
        assert!(matches!(
            synth.synthesize(&TextSequence::new(vec![]), &speaker()),
            Err(VoiceError::InvalidInput(_))
        ));
        assert!(matches!(
            synth.synthesize(&TextSequence::new(vec![1, 99]), &speaker()),
            Err(VoiceError::InvalidInput(_))
        ));
        let wrong_dim = SpeakerEmbedding::from_raw(vec![1.0; 7]).unwrap();
        assert!(matches!(
            synth.synthesize(&TextSequence::new(vec![1]), &wrong_dim),
            Err(VoiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cancel_stops_decoding() {
        let synth = with_stop_bias(-8.0, DecodePolicy::default());
        let cancel = CancelToken::new();
        let mut frames = 0;
        let err = synth
            .synthesize_into(&TextSequence::new(vec![1, 2]), &speaker(), &cancel, &mut |_| {
                frames += 1;
                if frames == 5 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, VoiceError::Cancelled);
        assert_eq!(frames, 5);
    }

    #[test]
    fn test_sink_error_propagates() {
        let synth = with_stop_bias(-8.0, DecodePolicy::default());
        let err = synth
            .synthesize_into(&TextSequence::new(vec![1]), &speaker(), &CancelToken::new(), &mut |_| {
                Err(VoiceError::Interrupted("receiver gone".into()))
            })
            .unwrap_err();
        assert!(matches!(err, VoiceError::Interrupted(_)));
    }

    #[test]
    fn test_deterministic_output() {
        let synth = with_stop_bias(8.0, DecodePolicy::default());
        let tokens = TextSequence::new(vec![3, 1, 4, 1, 5]);
        assert_eq!(
            synth.synthesize(&tokens, &speaker()).unwrap(),
            synth.synthesize(&tokens, &speaker()).unwrap()
        );
    }

    #[test]
    fn test_param_shape_mismatch() {
        let config = tiny_config();
        let mut params = SynthesizerParams::random(&config, 1);
        params.frame_proj = Linear::random(&mut StdRng::seed_from_u64(0), 3, 3);
        assert!(matches!(
            NeuralSynthesizer::new(config, params, DecodePolicy::default()),
            Err(VoiceError::ModelLoad(_))
        ));
    }
}
