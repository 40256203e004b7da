use std::time::Instant;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use voice_core::{CancelToken, DeliveryMode, PipelineModels, TextSequence};

use crate::audio::{decode_wav_base64, encode_wav_base64};
use crate::error::ApiError;
use crate::metrics::{EndpointMetrics, MetricsResponse};
use crate::validation::{validate_reference, validate_tokens};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub reference_wav_base64: String,
}

#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub embedding: Vec<f32>,
    pub dim: usize,
    pub reference_duration_ms: u64,
}

/// Body of `POST /clone`, also the first message of a `/stream` session.
#[derive(Debug, Clone, Deserialize)]
pub struct CloneRequest {
    pub reference_wav_base64: String,
    pub tokens: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct CloneResponse {
    pub audio_base64: String,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub loaded: PipelineModels,
    pub available: Vec<String>,
    pub sample_rate: u32,
    pub embedding_dim: usize,
}

/// Cancels synthesis when the request future is dropped, e.g. on timeout.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn track<T>(metrics: &EndpointMetrics, started: Instant, result: Result<T, ApiError>) -> Result<T, ApiError> {
    metrics.record_request(started.elapsed().as_millis() as u64);
    if result.is_err() {
        metrics.record_error();
    }
    result
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(
        state
            .metrics
            .snapshot(state.pipeline.cache_stats(), state.pipeline.resources()),
    )
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        loaded: state.models.clone(),
        available: state.available.iter().map(|id| id.to_string()).collect(),
        sample_rate: state.pipeline.sample_rate(),
        embedding_dim: state.pipeline.embedding_dim(),
    })
}

pub async fn embed_endpoint(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, ApiError> {
    let started = Instant::now();
    let result = embed(&state, req).await;
    track(&state.metrics.embed, started, result).map(Json)
}

async fn embed(state: &AppState, req: EmbedRequest) -> Result<EmbedResponse, ApiError> {
    let reference = decode_wav_base64(&req.reference_wav_base64)?;
    validate_reference(&reference, state.config.max_reference_secs)?;
    let reference_duration_ms = reference.duration().as_millis() as u64;

    let pipeline = state.pipeline.clone();
    let embedding = tokio::task::spawn_blocking(move || pipeline.embed_reference(&reference))
        .await
        .map_err(|e| ApiError::InternalError(format!("Task join error: {e}")))??;

    Ok(EmbedResponse {
        embedding: embedding.as_slice().to_vec(),
        dim: embedding.dim(),
        reference_duration_ms,
    })
}

pub async fn clone_endpoint(
    State(state): State<AppState>,
    Json(req): Json<CloneRequest>,
) -> Result<Json<CloneResponse>, ApiError> {
    let started = Instant::now();
    let result = clone_speech(&state, req).await;
    track(&state.metrics.clone, started, result).map(Json)
}

async fn clone_speech(state: &AppState, req: CloneRequest) -> Result<CloneResponse, ApiError> {
    let started = Instant::now();
    validate_tokens(&req.tokens, state.config.max_tokens)?;
    let reference = decode_wav_base64(&req.reference_wav_base64)?;
    validate_reference(&reference, state.config.max_reference_secs)?;

    let cancel = CancelToken::new();
    let _guard = CancelOnDrop(cancel.clone());
    let wav = state
        .pipeline
        .clone_and_speak(reference, TextSequence::new(req.tokens), DeliveryMode::Complete, cancel)
        .await?
        .into_waveform()
        .ok_or_else(|| ApiError::InternalError("Pipeline returned a stream for a batch request".into()))?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let duration_ms = wav.duration().as_millis() as u64;
    state.metrics.synthesis.record_synthesis(elapsed_ms, duration_ms);
    info!(duration_ms, elapsed_ms, "Clone request complete");

    Ok(CloneResponse {
        audio_base64: encode_wav_base64(&wav)?,
        sample_rate: wav.sample_rate(),
        duration_ms,
    })
}
