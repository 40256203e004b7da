use voice_core::Waveform;

use crate::error::ApiError;

/// Validate the token ids of a clone request
pub fn validate_tokens(tokens: &[u32], max_tokens: usize) -> Result<(), ApiError> {
    if tokens.is_empty() {
        return Err(ApiError::InvalidInput("Tokens cannot be empty".to_string()));
    }
    if tokens.len() > max_tokens {
        return Err(ApiError::InvalidInput(format!(
            "Too many tokens (max {})",
            max_tokens
        )));
    }
    Ok(())
}

/// Reject references too long to embed within a request
pub fn validate_reference(reference: &Waveform, max_secs: f32) -> Result<(), ApiError> {
    if reference.is_empty() {
        return Err(ApiError::InvalidInput("Reference audio is empty".to_string()));
    }
    let secs = reference.duration_secs();
    if secs > max_secs {
        return Err(ApiError::InvalidInput(format!(
            "Reference audio too long ({:.1}s, max {:.1}s)",
            secs, max_secs
        )));
    }
    Ok(())
}
