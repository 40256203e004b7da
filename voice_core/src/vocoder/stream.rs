use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{Result, VoiceError};
use crate::traits::Vocodable;
use crate::types::AudioChunk;

/// Window layout for streamed vocoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamWindowing {
    /// New frames covered by each window.
    pub window_frames: usize,
    /// Frames re-rendered from the previous window and cross-faded.
    pub overlap_frames: usize,
    /// Look-around frames; defaults to what the vocoder reports.
    pub context_frames: Option<usize>,
}

impl Default for StreamWindowing {
    fn default() -> Self {
        Self {
            window_frames: 32,
            overlap_frames: 4,
            context_frames: None,
        }
    }
}

impl StreamWindowing {
    pub fn validate(&self) -> Result<()> {
        if self.window_frames == 0 {
            return Err(VoiceError::invalid("window_frames must be at least 1"));
        }
        if self.overlap_frames >= self.window_frames {
            return Err(VoiceError::invalid(format!(
                "overlap_frames {} must be smaller than window_frames {}",
                self.overlap_frames, self.window_frames
            )));
        }
        Ok(())
    }
}

/// Incremental windowed vocoding.
///
/// Frames are pushed as they arrive; a window is rendered once the frames it
/// needs (its own, the overlap lead-in, and the look-around context) are
/// buffered, or once input is complete. Window `k` renders frames
/// `[k*W - O, (k+1)*W)`; its first `O * hop` samples are cross-faded with the
/// held tail of window `k - 1` and its last `O * hop` samples are held back for
/// window `k + 1`. Chunk indices start at 0 and exactly one chunk is final.
pub struct StreamingVocoder<'v> {
    vocoder: &'v dyn Vocodable,
    windowing: StreamWindowing,
    context: usize,
    cancel: CancelToken,
    /// Frames from absolute index `base` onwards.
    frames: Vec<Vec<f32>>,
    base: usize,
    input_done: bool,
    next_window: usize,
    tail: Vec<f32>,
    next_index: u64,
    finished: bool,
}

impl<'v> StreamingVocoder<'v> {
    pub fn new(vocoder: &'v dyn Vocodable, windowing: StreamWindowing, cancel: CancelToken) -> Result<Self> {
        windowing.validate()?;
        if !vocoder.supports_streaming() {
            return Err(VoiceError::invalid(
                "vocoder cannot render in windows; use complete delivery",
            ));
        }
        let context = windowing
            .context_frames
            .unwrap_or_else(|| vocoder.context_frames());
        Ok(Self {
            vocoder,
            windowing,
            context,
            cancel,
            frames: Vec::new(),
            base: 0,
            input_done: false,
            next_window: 0,
            tail: Vec::new(),
            next_index: 0,
            finished: false,
        })
    }

    pub fn push_frame(&mut self, frame: Vec<f32>) -> Result<()> {
        if self.input_done {
            return Err(VoiceError::invalid("frame pushed after input was finished"));
        }
        if frame.len() != self.vocoder.n_mels() {
            return Err(VoiceError::invalid(format!(
                "frame has {} values, vocoder expects {}",
                frame.len(),
                self.vocoder.n_mels()
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// No more frames will arrive.
    pub fn finish_input(&mut self) {
        self.input_done = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames received so far.
    pub fn frames_received(&self) -> usize {
        self.base + self.frames.len()
    }

    /// Next chunk if one can be produced with the frames buffered now.
    pub fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        if self.finished {
            return Ok(None);
        }
        let w = self.windowing.window_frames;
        let o = self.windowing.overlap_frames;
        let hop = self.vocoder.hop_length();
        let total = self.frames_received();

        let own_start = self.next_window * w;
        if self.input_done && own_start >= total {
            // Everything rendered; release whatever is held back
            let samples = std::mem::take(&mut self.tail);
            return Ok(Some(self.emit(samples, true)));
        }

        let own_end = own_start + w;
        let ready = if self.input_done {
            true
        } else {
            total >= own_end + self.context
        };
        if !ready {
            return Ok(None);
        }
        self.cancel.check()?;

        let end = own_end.min(total);
        let start = own_start.saturating_sub(o);
        let rendered = self
            .vocoder
            .render(&self.frames, start - self.base, end - self.base)?;

        let lead_in = (own_start - start) * hop;
        let mut samples = Vec::with_capacity(rendered.len());
        if lead_in > 0 {
            let fade = self.tail.len().min(lead_in);
            for i in 0..fade {
                let a = (i as f32 + 0.5) / fade as f32;
                samples.push(self.tail[i] * (1.0 - a) + rendered[i] * a);
            }
            samples.extend_from_slice(&rendered[fade..]);
        } else {
            samples.extend_from_slice(&rendered);
        }

        let is_last = self.input_done && end >= total;
        self.next_window += 1;
        if is_last {
            self.tail.clear();
            return Ok(Some(self.emit(samples, true)));
        }

        let hold = (o * hop).min(samples.len());
        self.tail = samples.split_off(samples.len() - hold);
        self.drop_consumed_frames();
        Ok(Some(self.emit(samples, false)))
    }

    fn emit(&mut self, samples: Vec<f32>, is_final: bool) -> AudioChunk {
        let chunk = AudioChunk::new(self.next_index, samples, self.vocoder.sample_rate(), is_final);
        self.next_index += 1;
        if is_final {
            self.finished = true;
            self.frames.clear();
        }
        chunk
    }

    /// Drop frames no later window can read.
    fn drop_consumed_frames(&mut self) {
        let next_start = (self.next_window * self.windowing.window_frames)
            .saturating_sub(self.windowing.overlap_frames);
        let keep_from = next_start.saturating_sub(self.context);
        if keep_from > self.base {
            let n = (keep_from - self.base).min(self.frames.len());
            self.frames.drain(..n);
            self.base += n;
        }
    }
}

/// Lazy iterator of chunks over a complete frame sequence.
///
/// Yields `Err` at most once; the iterator is fused after an error or the final chunk.
pub struct VocoderStream<'v> {
    inner: StreamingVocoder<'v>,
    pending: std::vec::IntoIter<Vec<f32>>,
    failed: bool,
}

impl<'v> VocoderStream<'v> {
    pub fn new(
        vocoder: &'v dyn Vocodable,
        frames: Vec<Vec<f32>>,
        windowing: StreamWindowing,
        cancel: CancelToken,
    ) -> Result<Self> {
        Ok(Self {
            inner: StreamingVocoder::new(vocoder, windowing, cancel)?,
            pending: frames.into_iter(),
            failed: false,
        })
    }

    fn advance(&mut self) -> Result<Option<AudioChunk>> {
        loop {
            if let Some(chunk) = self.inner.next_chunk()? {
                return Ok(Some(chunk));
            }
            if self.inner.is_finished() {
                return Ok(None);
            }
            match self.pending.next() {
                Some(frame) => self.inner.push_frame(frame)?,
                None => self.inner.finish_input(),
            }
        }
    }
}

impl Iterator for VocoderStream<'_> {
    type Item = Result<AudioChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
