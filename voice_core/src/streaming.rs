//! Queues and the consumer-facing stream used for incremental delivery.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::{Result, VoiceError};
use crate::types::{AudioChunk, Waveform};

/// Live counts of queued frames, queued chunks and running workers.
///
/// Every queued item holds a guard that decrements its gauge when dropped,
/// whether it was consumed or discarded.
#[derive(Debug, Clone, Default)]
pub struct StreamResources {
    frames: Arc<AtomicUsize>,
    chunks: Arc<AtomicUsize>,
    workers: Arc<AtomicUsize>,
}

impl StreamResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn buffered_chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.buffered_frames() == 0 && self.buffered_chunks() == 0 && self.live_workers() == 0
    }

    /// Wait up to `timeout` for every gauge to reach zero.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_idle() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    pub(crate) fn frame_guard(&self) -> GaugeGuard {
        GaugeGuard::new(&self.frames)
    }

    pub(crate) fn chunk_guard(&self) -> GaugeGuard {
        GaugeGuard::new(&self.chunks)
    }

    pub(crate) fn worker_guard(&self) -> GaugeGuard {
        GaugeGuard::new(&self.workers)
    }
}

#[derive(Debug)]
pub(crate) struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    fn new(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Synthesizer -> vocoder queue message.
#[derive(Debug)]
pub(crate) enum FrameMessage {
    Frame(QueuedFrame),
    Finished,
    Failed(VoiceError),
}

#[derive(Debug)]
pub(crate) struct QueuedFrame {
    frame: Vec<f32>,
    _guard: GaugeGuard,
}

impl QueuedFrame {
    pub(crate) fn new(frame: Vec<f32>, resources: &StreamResources) -> Self {
        Self {
            frame,
            _guard: resources.frame_guard(),
        }
    }

    pub(crate) fn into_frame(self) -> Vec<f32> {
        self.frame
    }
}

/// Vocoder -> consumer queue item.
#[derive(Debug)]
pub(crate) struct QueuedChunk {
    result: Result<AudioChunk>,
    _guard: GaugeGuard,
}

impl QueuedChunk {
    pub(crate) fn new(result: Result<AudioChunk>, resources: &StreamResources) -> Self {
        Self {
            result,
            _guard: resources.chunk_guard(),
        }
    }
}

pub(crate) fn frame_channel(capacity: usize) -> (mpsc::Sender<FrameMessage>, mpsc::Receiver<FrameMessage>) {
    mpsc::channel(capacity.max(1))
}

pub(crate) fn chunk_channel(capacity: usize) -> (mpsc::Sender<QueuedChunk>, mpsc::Receiver<QueuedChunk>) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    /// Cancelled by the consumer; the `Cancelled` marker is still to be yielded.
    Cancelled,
    Done,
}

/// Ordered audio chunks of one utterance.
///
/// Yields `Ok` chunks with indices 0, 1, 2, ... until the one marked final.
/// A failure in either worker arrives as a single trailing `Err`; if the
/// workers vanish without a final chunk the stream yields
/// `Err(Interrupted)`. After [`cancel`](Self::cancel) no further chunks are
/// yielded, only `Err(Cancelled)` once. Dropping the stream cancels it.
#[derive(Debug)]
pub struct ChunkStream {
    receiver: mpsc::Receiver<QueuedChunk>,
    cancel: CancelToken,
    sample_rate: u32,
    next_index: u64,
    state: StreamState,
}

impl ChunkStream {
    pub(crate) fn new(receiver: mpsc::Receiver<QueuedChunk>, cancel: CancelToken, sample_rate: u32) -> Self {
        Self {
            receiver,
            cancel,
            sample_rate,
            next_index: 0,
            state: StreamState::Open,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stop both workers and discard anything already buffered.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        if self.state == StreamState::Open {
            tracing::debug!(chunks = self.next_index, "Stream cancelled by consumer");
            self.state = StreamState::Cancelled;
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == StreamState::Done
    }

    /// Blocking variant of polling the stream, for use off the async runtime.
    pub fn blocking_next(&mut self) -> Option<Result<AudioChunk>> {
        match self.state {
            StreamState::Done => None,
            StreamState::Cancelled => self.finish_cancelled(),
            StreamState::Open => {
                let message = self.receiver.blocking_recv();
                self.accept(message)
            }
        }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<AudioChunk>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drain the stream into one waveform.
    pub async fn collect_waveform(mut self) -> Result<Waveform> {
        let mut samples = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            samples.extend_from_slice(&chunk?.samples);
        }
        Ok(Waveform::new(samples, self.sample_rate))
    }

    fn finish_cancelled(&mut self) -> Option<Result<AudioChunk>> {
        self.state = StreamState::Done;
        Some(Err(VoiceError::Cancelled))
    }

    fn accept(&mut self, message: Option<QueuedChunk>) -> Option<Result<AudioChunk>> {
        let Some(queued) = message else {
            self.state = StreamState::Done;
            if self.cancel.is_cancelled() {
                return Some(Err(VoiceError::Cancelled));
            }
            tracing::warn!(chunks = self.next_index, "Chunk queue closed before the final chunk");
            return Some(Err(VoiceError::Interrupted(
                "stream ended before the final chunk".into(),
            )));
        };

        match queued.result {
            Ok(chunk) => {
                if chunk.index != self.next_index {
                    self.state = StreamState::Done;
                    self.cancel.cancel();
                    return Some(Err(VoiceError::Interrupted(format!(
                        "chunk {} arrived, expected {}",
                        chunk.index, self.next_index
                    ))));
                }
                self.next_index += 1;
                if chunk.is_final {
                    self.state = StreamState::Done;
                    tracing::debug!(chunks = self.next_index, "Stream finished");
                }
                Some(Ok(chunk))
            }
            Err(e) => {
                self.state = StreamState::Done;
                Some(Err(e))
            }
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<AudioChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.state {
            StreamState::Done => Poll::Ready(None),
            StreamState::Cancelled => Poll::Ready(self.finish_cancelled()),
            StreamState::Open => match self.receiver.poll_recv(cx) {
                Poll::Ready(message) => Poll::Ready(self.accept(message)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if self.state != StreamState::Done {
            self.cancel();
        }
    }
}
