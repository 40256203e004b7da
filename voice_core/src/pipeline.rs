//! Orchestration of the three stages: embed, synthesize, vocode.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::cache::{CacheStats, EmbeddingCache};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::error::{Result, VoiceError};
use crate::registry::{load_models, ModelStore, PipelineModels};
use crate::streaming::{
    chunk_channel, frame_channel, ChunkStream, FrameMessage, QueuedChunk, QueuedFrame, StreamResources,
};
use crate::synthesizer::SynthesisReport;
use crate::text::TextSequence;
use crate::traits::{Embeddable, Synthesizable, Vocodable};
use crate::types::{AcousticFeatures, SpeakerEmbedding, Waveform};
use crate::vocoder::StreamingVocoder;

/// How `clone_and_speak` hands back audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Complete,
    Streaming,
}

#[derive(Debug)]
pub enum SpeechOutput {
    Complete(Waveform),
    Streaming(ChunkStream),
}

impl SpeechOutput {
    pub fn into_waveform(self) -> Option<Waveform> {
        match self {
            SpeechOutput::Complete(wav) => Some(wav),
            SpeechOutput::Streaming(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ChunkStream> {
        match self {
            SpeechOutput::Streaming(stream) => Some(stream),
            SpeechOutput::Complete(_) => None,
        }
    }
}

/// Loaded models plus the shared state of one cloning service.
///
/// Cloning is cheap; all clones share models, cache and resource gauges.
#[derive(Clone)]
pub struct VoicePipeline {
    encoder: Arc<dyn Embeddable>,
    synthesizer: Arc<dyn Synthesizable>,
    vocoder: Arc<dyn Vocodable>,
    config: Arc<PipelineConfig>,
    cache: Arc<EmbeddingCache>,
    resources: StreamResources,
}

// Manual Debug implementation since the model trait objects don't implement Debug
impl std::fmt::Debug for VoicePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoicePipeline")
            .field("encoder", &"<Embeddable>")
            .field("synthesizer", &"<Synthesizable>")
            .field("vocoder", &"<Vocodable>")
            .field("config", &self.config)
            .finish()
    }
}

impl VoicePipeline {
    pub fn from_parts(
        encoder: Arc<dyn Embeddable>,
        synthesizer: Arc<dyn Synthesizable>,
        vocoder: Arc<dyn Vocodable>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if encoder.embedding_dim() != synthesizer.embedding_dim() {
            return Err(VoiceError::model_load(format!(
                "encoder produces {}-d embeddings but synthesizer expects {}",
                encoder.embedding_dim(),
                synthesizer.embedding_dim()
            )));
        }
        if synthesizer.n_mels() != vocoder.n_mels() {
            return Err(VoiceError::model_load(format!(
                "synthesizer emits {} mel bands but vocoder expects {}",
                synthesizer.n_mels(),
                vocoder.n_mels()
            )));
        }
        if synthesizer.sample_rate() != vocoder.sample_rate()
            || synthesizer.hop_length() != vocoder.hop_length()
        {
            return Err(VoiceError::model_load(format!(
                "synthesizer framing ({} Hz, hop {}) does not match vocoder ({} Hz, hop {})",
                synthesizer.sample_rate(),
                synthesizer.hop_length(),
                vocoder.sample_rate(),
                vocoder.hop_length()
            )));
        }

        tracing::info!(
            embedding_dim = encoder.embedding_dim(),
            n_mels = vocoder.n_mels(),
            sample_rate = vocoder.sample_rate(),
            "Voice pipeline assembled"
        );
        Ok(Self {
            encoder,
            synthesizer,
            vocoder,
            cache: Arc::new(EmbeddingCache::new(&config.cache)),
            config: Arc::new(config),
            resources: StreamResources::new(),
        })
    }

    /// Load the three models from `store` and wire them together.
    pub fn load(store: &dyn ModelStore, models: &PipelineModels, config: PipelineConfig) -> Result<Self> {
        let loaded = load_models(store, models, config.decode.clone())?;
        Self::from_parts(loaded.encoder, loaded.synthesizer, loaded.vocoder, config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.vocoder.sample_rate()
    }

    pub fn embedding_dim(&self) -> usize {
        self.encoder.embedding_dim()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn resources(&self) -> &StreamResources {
        &self.resources
    }

    /// Speaker embedding for `reference`, served from the cache when the same
    /// audio was seen before.
    pub fn embed_reference(&self, reference: &Waveform) -> Result<Arc<SpeakerEmbedding>> {
        if reference.is_empty() {
            return Err(VoiceError::invalid("reference audio is empty"));
        }
        self.cache.get_or_embed(reference, || {
            self.encoder.embed(reference.samples(), reference.sample_rate())
        })
    }

    /// Synthesize every segment of `tokens` in order, separating segments with
    /// silence frames. Frames go to `sink` as they are produced.
    pub fn synthesize_segments(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(Vec<f32>) -> Result<()>,
    ) -> Result<Vec<SynthesisReport>> {
        if tokens.is_empty() {
            return Err(VoiceError::invalid("token sequence cannot be empty"));
        }
        let segments = tokens.split_segments(&self.config.segmentation);
        let silence = vec![self.synthesizer.scale().silence(); self.synthesizer.n_mels()];

        let mut reports = Vec::with_capacity(segments.len());
        for (i, segment) in segments.iter().enumerate() {
            tracing::debug!(
                segment = i,
                of = segments.len(),
                tokens = segment.tokens.len(),
                "Synthesizing segment"
            );
            let report = self
                .synthesizer
                .synthesize_into(&segment.tokens, embedding, cancel, sink)?;
            reports.push(report);
            for _ in 0..segment.pause_frames {
                sink(silence.clone())?;
            }
        }
        Ok(reports)
    }

    pub fn synthesize_features(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
        cancel: &CancelToken,
    ) -> Result<AcousticFeatures> {
        let mut features = AcousticFeatures::empty(self.synthesizer.n_mels(), self.synthesizer.scale());
        self.synthesize_segments(tokens, embedding, cancel, &mut |frame| features.push(frame))?;
        Ok(features)
    }

    /// Full clone-and-speak on the calling thread.
    pub fn speak_blocking(
        &self,
        reference: &Waveform,
        tokens: &TextSequence,
        cancel: &CancelToken,
    ) -> Result<Waveform> {
        let started = Instant::now();
        let embedding = self.embed_reference(reference)?;
        let features = self.synthesize_features(tokens, &embedding, cancel)?;
        cancel.check()?;
        let wav = self.vocoder.vocode(&features)?;
        tracing::info!(
            frames = features.len(),
            duration_ms = wav.duration().as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Synthesis complete"
        );
        Ok(wav)
    }

    /// Clone the voice in `reference` and speak `tokens` with it.
    ///
    /// Reference and input problems are reported here, before any audio is
    /// produced. In streaming mode later failures arrive on the stream.
    pub async fn clone_and_speak(
        &self,
        reference: Waveform,
        tokens: TextSequence,
        mode: DeliveryMode,
        cancel: CancelToken,
    ) -> Result<SpeechOutput> {
        if tokens.is_empty() {
            return Err(VoiceError::invalid("token sequence cannot be empty"));
        }
        match mode {
            DeliveryMode::Complete => {
                let pipeline = self.clone();
                let wav = tokio::task::spawn_blocking(move || {
                    pipeline.speak_blocking(&reference, &tokens, &cancel)
                })
                .await
                .map_err(|e| VoiceError::Interrupted(format!("synthesis task failed: {}", e)))??;
                Ok(SpeechOutput::Complete(wav))
            }
            DeliveryMode::Streaming => {
                self.check_streamable()?;
                let pipeline = self.clone();
                let embedding = tokio::task::spawn_blocking(move || pipeline.embed_reference(&reference))
                    .await
                    .map_err(|e| VoiceError::Interrupted(format!("embedding task failed: {}", e)))??;
                Ok(SpeechOutput::Streaming(self.start_stream(embedding, tokens, cancel)?))
            }
        }
    }

    fn check_streamable(&self) -> Result<()> {
        if !self.vocoder.supports_streaming() {
            return Err(VoiceError::invalid(
                "the loaded vocoder cannot stream; use complete delivery",
            ));
        }
        Ok(())
    }

    /// Launch the synthesizer and vocoder workers and return the consumer end.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_stream(
        &self,
        embedding: Arc<SpeakerEmbedding>,
        tokens: TextSequence,
        cancel: CancelToken,
    ) -> Result<ChunkStream> {
        self.check_streamable()?;
        let streaming = &self.config.streaming;
        let (frame_tx, frame_rx) = frame_channel(streaming.frame_queue_capacity);
        let (chunk_tx, chunk_rx) = chunk_channel(streaming.chunk_queue_capacity);
        tracing::debug!(tokens = tokens.len(), "Starting stream");

        let producer = self.clone();
        let producer_cancel = cancel.clone();
        let producer_guard = self.resources.worker_guard();
        tokio::task::spawn_blocking(move || {
            let _worker = producer_guard;
            producer.produce_frames(&tokens, &embedding, &producer_cancel, frame_tx);
        });

        let consumer = self.clone();
        let consumer_cancel = cancel.clone();
        let consumer_guard = self.resources.worker_guard();
        tokio::task::spawn_blocking(move || {
            let _worker = consumer_guard;
            consumer.render_chunks(frame_rx, chunk_tx, &consumer_cancel);
        });

        Ok(ChunkStream::new(chunk_rx, cancel, self.vocoder.sample_rate()))
    }

    fn produce_frames(
        &self,
        tokens: &TextSequence,
        embedding: &SpeakerEmbedding,
        cancel: &CancelToken,
        frame_tx: mpsc::Sender<FrameMessage>,
    ) {
        let resources = &self.resources;
        let mut sink = |frame: Vec<f32>| -> Result<()> {
            frame_tx
                .blocking_send(FrameMessage::Frame(QueuedFrame::new(frame, resources)))
                .map_err(|_| VoiceError::Interrupted("vocoder worker stopped".into()))
        };
        let message = match self.synthesize_segments(tokens, embedding, cancel, &mut sink) {
            Ok(reports) => {
                let steps: usize = reports.iter().map(|r| r.steps).sum();
                tracing::debug!(segments = reports.len(), steps, "Synthesizer worker finished");
                FrameMessage::Finished
            }
            Err(e) => {
                if !matches!(e, VoiceError::Cancelled) {
                    tracing::warn!(error = %e, "Synthesizer worker failed");
                }
                FrameMessage::Failed(e)
            }
        };
        // The vocoder may already be gone after a cancel
        let _ = frame_tx.blocking_send(message);
    }

    fn render_chunks(
        &self,
        mut frame_rx: mpsc::Receiver<FrameMessage>,
        chunk_tx: mpsc::Sender<QueuedChunk>,
        cancel: &CancelToken,
    ) {
        let started = Instant::now();
        let result = self.run_vocoder(&mut frame_rx, &chunk_tx, cancel, started);
        if let Err(e) = result {
            if matches!(e, VoiceError::Cancelled) {
                tracing::debug!("Vocoder worker cancelled");
            } else {
                tracing::warn!(error = %e, "Vocoder worker failed");
            }
            let _ = chunk_tx.blocking_send(QueuedChunk::new(Err(e), &self.resources));
        }
    }

    fn run_vocoder(
        &self,
        frame_rx: &mut mpsc::Receiver<FrameMessage>,
        chunk_tx: &mpsc::Sender<QueuedChunk>,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<()> {
        let mut vocoder = StreamingVocoder::new(
            self.vocoder.as_ref(),
            self.config.streaming.windowing,
            cancel.clone(),
        )?;

        loop {
            match frame_rx.blocking_recv() {
                Some(FrameMessage::Frame(queued)) => vocoder.push_frame(queued.into_frame())?,
                Some(FrameMessage::Finished) => vocoder.finish_input(),
                Some(FrameMessage::Failed(e)) => return Err(e),
                None => {
                    return Err(if cancel.is_cancelled() {
                        VoiceError::Cancelled
                    } else {
                        VoiceError::Interrupted("synthesizer worker exited early".into())
                    });
                }
            }

            while let Some(chunk) = vocoder.next_chunk()? {
                if chunk.index == 0 {
                    tracing::info!(
                        first_chunk_ms = started.elapsed().as_millis() as u64,
                        frames = vocoder.frames_received(),
                        "First audio chunk ready"
                    );
                }
                let is_final = chunk.is_final;
                if chunk_tx
                    .blocking_send(QueuedChunk::new(Ok(chunk), &self.resources))
                    .is_err()
                {
                    // Consumer dropped or cancelled the stream
                    cancel.cancel();
                    return Ok(());
                }
                if is_final {
                    tracing::debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Vocoder worker finished"
                    );
                    return Ok(());
                }
            }
        }
    }
}
