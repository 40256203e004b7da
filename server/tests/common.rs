//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt;
use voice_core::{
    DecodePolicy, EncoderConfig, EncoderParams, MelConfig, ModelId, NeuralSynthesizer, NeuralVocoder,
    PipelineConfig, PipelineModels, SpeakerEncoder, SynthesizerConfig, SynthesizerParams,
    VocoderConfig, VocoderParams, VoicePipeline, Waveform,
};
use voice_server::{audio::encode_wav_base64, build_router, config::ServerConfig, AppState};

pub const SAMPLE_RATE: u32 = 16_000;

fn mel() -> MelConfig {
    MelConfig {
        n_mels: 10,
        ..MelConfig::synthesizer_16k()
    }
}

/// Tiny seeded models; `stop_bias` pins the synthesizer's stop logit.
pub fn tiny_pipeline(stop_bias: f32, policy: DecodePolicy) -> VoicePipeline {
    let encoder_config = EncoderConfig {
        hidden_size: 12,
        num_layers: 2,
        embedding_dim: 8,
        final_relu: false,
        trim_silence: None,
        ..Default::default()
    };
    let encoder_params = EncoderParams::random(&encoder_config, 17);

    let synth_config = SynthesizerConfig {
        mel: mel(),
        vocab_size: 16,
        token_dim: 6,
        encoder_layers: 1,
        encoder_kernel: 3,
        speaker_dim: 8,
        prenet_dims: vec![8],
        decoder_dim: 10,
        attention_dim: 6,
        location_filters: 3,
        location_kernel: 5,
    };
    let mut synth_params = SynthesizerParams::random(&synth_config, 23);
    synth_params.stop_proj.weight.fill(0.0);
    synth_params.stop_proj.bias.fill(stop_bias);

    let vocoder_config = VocoderConfig {
        mel: mel(),
        channels: 6,
        layers: 2,
        kernel: 3,
    };
    let vocoder_params = VocoderParams::random(&vocoder_config, 29);

    let mut config = PipelineConfig::default();
    config.streaming.windowing.window_frames = 2;
    config.streaming.windowing.overlap_frames = 1;

    VoicePipeline::from_parts(
        Arc::new(SpeakerEncoder::new(encoder_config, encoder_params).unwrap()),
        Arc::new(NeuralSynthesizer::new(synth_config, synth_params, policy).unwrap()),
        Arc::new(NeuralVocoder::new(vocoder_config, vocoder_params).unwrap()),
        config,
    )
    .unwrap()
}

pub fn models() -> PipelineModels {
    PipelineModels {
        encoder: ModelId::new("encoder", "1"),
        synthesizer: ModelId::new("synthesizer", "1"),
        vocoder: ModelId::new("vocoder", "1"),
    }
}

pub fn test_state_with(pipeline: VoicePipeline) -> AppState {
    let config = ServerConfig {
        max_reference_secs: 10.0,
        max_tokens: 64,
        ..Default::default()
    };
    let models = models();
    let available = vec![
        models.encoder.clone(),
        models.synthesizer.clone(),
        models.vocoder.clone(),
    ];
    AppState::new(pipeline, models, available, config)
}

pub fn test_state() -> AppState {
    test_state_with(tiny_pipeline(8.0, DecodePolicy::default()))
}

/// Create a test app instance
pub fn create_test_app() -> (Router, AppState) {
    let state = test_state();
    (build_router(state.clone()), state)
}

/// Harmonic test voice as a base64 WAV
pub fn voice_wav_base64(seconds: f32) -> String {
    let n = (seconds * SAMPLE_RATE as f32) as usize;
    let samples = (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (1..6)
                .map(|h| 0.2 / h as f32 * (2.0 * std::f32::consts::PI * 130.0 * h as f32 * t).sin())
                .sum()
        })
        .collect();
    encode_wav_base64(&Waveform::new(samples, SAMPLE_RATE)).unwrap()
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
}

pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
}
