//! `GET /stream`: one cloning request per WebSocket session.
//!
//! The client sends a [`CloneRequest`] as its first text message. The server
//! answers with a `status` message, then `chunk` messages in order, and ends
//! with `done` or `error`. A `{"type": "cancel"}` message or closing the socket
//! stops synthesis.

use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use voice_core::{AudioChunk, CancelToken, DeliveryMode, TextSequence, VoiceError};

use crate::audio::decode_wav_base64;
use crate::error::ApiError;
use crate::handlers::CloneRequest;
use crate::validation::{validate_reference, validate_tokens};
use crate::AppState;

/// Outgoing messages, serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        status: String,
        sample_rate: u32,
    },
    Chunk {
        index: u64,
        audio: Vec<f32>,
        sample_rate: u32,
        duration_ms: f64,
        is_final: bool,
    },
    Done {
        chunks: u64,
        duration_ms: u64,
        elapsed_ms: u64,
    },
    Error {
        error: String,
        code: u16,
    },
}

impl From<AudioChunk> for StreamEvent {
    fn from(chunk: AudioChunk) -> Self {
        StreamEvent::Chunk {
            index: chunk.index,
            duration_ms: chunk.duration_ms(),
            sample_rate: chunk.sample_rate,
            is_final: chunk.is_final,
            audio: chunk.samples,
        }
    }
}

impl From<&ApiError> for StreamEvent {
    fn from(error: &ApiError) -> Self {
        let body = error.body();
        StreamEvent::Error {
            error: body.error,
            code: body.code,
        }
    }
}

impl StreamEvent {
    fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!("Failed to serialize stream event: {e}");
                None
            }
        }
    }
}

pub async fn stream_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn is_cancel(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "cancel"))
        .unwrap_or(false)
}

/// Wait for the request message. `None` if the client left first.
async fn read_request(receiver: &mut futures_util::stream::SplitStream<WebSocket>) -> Option<Result<CloneRequest, ApiError>> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return Some(
                    serde_json::from_str(text.as_str())
                        .map_err(|e| ApiError::InvalidInput(format!("Malformed stream request: {e}"))),
                );
            }
            Ok(Message::Binary(_)) => {
                return Some(Err(ApiError::InvalidInput(
                    "Stream request must be a JSON text message".into(),
                )));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let request = match read_request(&mut receiver).await {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            state.metrics.stream.record_error();
            if let Some(message) = StreamEvent::from(&e).to_message() {
                let _ = sender.send(message).await;
            }
            let _ = sender.close().await;
            return;
        }
        None => return,
    };

    let (tx, mut rx) = mpsc::channel::<StreamEvent>(8);
    let cancel = CancelToken::new();
    let session = tokio::spawn({
        let state = state.clone();
        let cancel = cancel.clone();
        async move { run_session(&state, request, tx, cancel).await }
    });

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let Some(message) = event.to_message() else { continue };
                    if let Err(e) = sender.send(message).await {
                        warn!("Failed to send WS message: {e}");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if is_cancel(text.as_str()) => {
                    debug!("Client cancelled stream");
                    cancel.cancel();
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!("Client left mid-stream");
                    cancel.cancel();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    // Unblock the session if it is waiting on a full queue
    drop(rx);
    let _ = session.await;
    let _ = sender.close().await;
}

/// Drive one streaming request, reporting progress as [`StreamEvent`]s.
///
/// Always ends with a `Done` or `Error` event unless `events` is closed.
pub async fn run_session(
    state: &AppState,
    request: CloneRequest,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancelToken,
) {
    let started = Instant::now();
    let result = stream_speech(state, request, &events, cancel, started).await;
    state
        .metrics
        .stream
        .record_request(started.elapsed().as_millis() as u64);

    if let Err(e) = result {
        state.metrics.stream.record_error();
        if matches!(e, ApiError::Voice(VoiceError::Cancelled)) {
            state.metrics.synthesis.record_stream_cancelled();
        }
        let _ = events.send(StreamEvent::from(&e)).await;
    }
}

async fn stream_speech(
    state: &AppState,
    request: CloneRequest,
    events: &mpsc::Sender<StreamEvent>,
    cancel: CancelToken,
    started: Instant,
) -> Result<(), ApiError> {
    validate_tokens(&request.tokens, state.config.max_tokens)?;
    let reference = decode_wav_base64(&request.reference_wav_base64)?;
    validate_reference(&reference, state.config.max_reference_secs)?;

    let mut stream = state
        .pipeline
        .clone_and_speak(reference, TextSequence::new(request.tokens), DeliveryMode::Streaming, cancel)
        .await?
        .into_stream()
        .ok_or_else(|| ApiError::InternalError("Pipeline returned complete audio for a stream".into()))?;
    state.metrics.synthesis.record_stream_started();

    let gone = || ApiError::Voice(VoiceError::Cancelled);
    events
        .send(StreamEvent::Status {
            status: "streaming".into(),
            sample_rate: stream.sample_rate(),
        })
        .await
        .map_err(|_| gone())?;

    let mut chunks = 0u64;
    let mut samples = 0usize;
    while let Some(item) = stream.next_chunk().await {
        let chunk = item?;
        if chunk.index == 0 {
            state
                .metrics
                .synthesis
                .record_first_chunk(started.elapsed().as_millis() as u64);
        }
        chunks += 1;
        samples += chunk.samples.len();
        if events.send(StreamEvent::from(chunk)).await.is_err() {
            stream.cancel();
            return Err(gone());
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let duration_ms = (samples as f64 / stream.sample_rate() as f64 * 1000.0) as u64;
    state.metrics.synthesis.record_synthesis(elapsed_ms, duration_ms);
    events
        .send(StreamEvent::Done {
            chunks,
            duration_ms,
            elapsed_ms,
        })
        .await
        .map_err(|_| gone())
}
