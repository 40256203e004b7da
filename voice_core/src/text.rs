//! Token sequences handed over by the external text frontend.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Normalized, tokenized input text (character or phoneme ids).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextSequence {
    tokens: Vec<u32>,
}

impl TextSequence {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Fails with `InvalidInput` for empty input or ids outside `vocab_size`.
    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        if self.tokens.is_empty() {
            return Err(VoiceError::invalid("token sequence cannot be empty"));
        }
        if let Some(bad) = self.tokens.iter().find(|&&t| t as usize >= vocab_size) {
            return Err(VoiceError::invalid(format!(
                "token id {} is outside the vocabulary (size {})",
                bad, vocab_size
            )));
        }
        Ok(())
    }

    /// Split at break tokens so each segment stays short enough to align.
    ///
    /// Sentence breaks get a longer pause than clause breaks; a segment cut
    /// only because it hit `max_tokens_per_segment` gets no pause.
    pub fn split_segments(&self, config: &SegmentConfig) -> Vec<Segment> {
        let max_len = config.max_tokens_per_segment.max(1);
        let mut segments = Vec::new();
        let mut current: Vec<u32> = Vec::new();

        for &token in &self.tokens {
            current.push(token);

            let pause = if config.sentence_breaks.contains(&token) {
                Some(config.sentence_pause_frames)
            } else if config.clause_breaks.contains(&token) {
                Some(config.clause_pause_frames)
            } else if current.len() >= max_len {
                Some(0)
            } else {
                None
            };

            if let Some(pause_frames) = pause {
                segments.push(Segment {
                    tokens: TextSequence::new(std::mem::take(&mut current)),
                    pause_frames,
                });
            }
        }

        if !current.is_empty() {
            segments.push(Segment {
                tokens: TextSequence::new(current),
                pause_frames: 0,
            });
        }

        // No pause after the last segment
        if let Some(last) = segments.last_mut() {
            last.pause_frames = 0;
        }

        segments
    }
}

impl From<Vec<u32>> for TextSequence {
    fn from(tokens: Vec<u32>) -> Self {
        Self::new(tokens)
    }
}

/// A slice of the input synthesized on its own, followed by `pause_frames` of silence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub tokens: TextSequence,
    pub pause_frames: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub max_tokens_per_segment: usize,
    /// Token ids ending a sentence (e.g. `.`, `!`, `?`).
    pub sentence_breaks: Vec<u32>,
    /// Token ids ending a clause (e.g. `,`, `;`, `:`).
    pub clause_breaks: Vec<u32>,
    pub sentence_pause_frames: usize,
    pub clause_pause_frames: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_segment: 200,
            sentence_breaks: Vec::new(),
            clause_breaks: Vec::new(),
            sentence_pause_frames: 24,
            clause_pause_frames: 10,
        }
    }
}
