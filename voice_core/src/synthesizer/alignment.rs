use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// What to do when attention jumps backwards past the tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonotonicityPolicy {
    Warn,
    Abort,
}

/// Decoding lifecycle of one synthesis call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    Idle,
    Decoding { step: usize },
    Completed { steps: usize },
    Aborted,
}

impl DecodePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecodePhase::Completed { .. } | DecodePhase::Aborted)
    }
}

/// Per-call attention bookkeeping.
#[derive(Debug, Clone)]
pub struct AlignmentState {
    /// Attention weights from the previous step.
    pub previous: Array1<f32>,
    /// Running sum of all attention weights so far.
    pub cumulative: Array1<f32>,
    /// Token currently attended most (argmax of the last weights).
    pub focus: usize,
    /// Furthest token position the focus has reached.
    pub furthest: usize,
    pub violations: usize,
}

impl AlignmentState {
    pub fn new(n_tokens: usize) -> Self {
        Self {
            previous: Array1::zeros(n_tokens),
            cumulative: Array1::zeros(n_tokens),
            focus: 0,
            furthest: 0,
            violations: 0,
        }
    }

    pub fn n_tokens(&self) -> usize {
        self.previous.len()
    }

    /// Record the weights of decoder step `step` and check monotonicity.
    pub fn update(
        &mut self,
        weights: Array1<f32>,
        step: usize,
        backward_tolerance: usize,
        policy: MonotonicityPolicy,
    ) -> Result<()> {
        let focus = argmax(&weights);
        self.cumulative += &weights;
        self.previous = weights;
        self.focus = focus;

        if focus + backward_tolerance < self.furthest {
            self.violations += 1;
            match policy {
                MonotonicityPolicy::Abort => {
                    return Err(VoiceError::alignment(
                        step + 1,
                        format!(
                            "attention jumped back from token {} to {}",
                            self.furthest, focus
                        ),
                    ));
                }
                MonotonicityPolicy::Warn => {
                    // Only the first jump goes out at warn level to keep long runs readable
                    if self.violations == 1 {
                        tracing::warn!(step, from = self.furthest, to = focus, "Attention moved backwards");
                    } else {
                        tracing::debug!(step, from = self.furthest, to = focus, "Attention moved backwards");
                    }
                }
            }
        }
        self.furthest = self.furthest.max(focus);
        Ok(())
    }

    /// Whether attention has reached the last `end_tolerance` tokens.
    pub fn reached_end(&self, end_tolerance: usize) -> bool {
        self.furthest + end_tolerance + 1 >= self.n_tokens()
    }
}

fn argmax(values: &Array1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}
