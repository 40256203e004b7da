use thiserror::Error;

/// Errors surfaced by the cloning pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VoiceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient reference audio: {duration_secs:.2}s (need at least {min_secs:.2}s)")]
    InsufficientAudio { duration_secs: f32, min_secs: f32 },

    #[error("Alignment failed after {steps} decoder steps: {reason}")]
    AlignmentFailure { steps: usize, reason: String },

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Synthesis cancelled")]
    Cancelled,

    #[error("Stream interrupted: {0}")]
    Interrupted(String),
}

impl VoiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        VoiceError::InvalidInput(msg.into())
    }

    pub fn model_load(msg: impl Into<String>) -> Self {
        VoiceError::ModelLoad(msg.into())
    }

    pub fn alignment(steps: usize, reason: impl Into<String>) -> Self {
        VoiceError::AlignmentFailure {
            steps,
            reason: reason.into(),
        }
    }

    /// Caller errors are surfaced immediately and never worth retrying as-is.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            VoiceError::InvalidInput(_) | VoiceError::InsufficientAudio { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
