// Configuration constants for the server

use std::path::PathBuf;
use std::time::Duration;

use voice_core::{ModelId, PipelineModels};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub model_dir: PathBuf,
    /// Optional JSON pipeline config; `VOICE_*` variables apply on top.
    pub pipeline_config: Option<PathBuf>,
    pub models: PipelineModels,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub max_reference_secs: f32,
    pub max_tokens: usize,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            model_dir: PathBuf::from("models"),
            pipeline_config: None,
            models: default_models(),
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            max_reference_secs: 30.0,
            max_tokens: 2000,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

fn default_models() -> PipelineModels {
    PipelineModels {
        encoder: ModelId::new("encoder", "1"),
        synthesizer: ModelId::new("synthesizer", "1"),
        vocoder: ModelId::new("vocoder", "1"),
    }
}

fn model_from_env(key: &str, default: ModelId) -> ModelId {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        let model_dir = std::env::var("MODEL_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let pipeline_config = std::env::var("PIPELINE_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let models = PipelineModels {
            encoder: model_from_env("ENCODER_MODEL", defaults.models.encoder),
            synthesizer: model_from_env("SYNTHESIZER_MODEL", defaults.models.synthesizer),
            vocoder: model_from_env("VOCODER_MODEL", defaults.models.vocoder),
        };

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.request_timeout_secs);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            });

        let max_reference_secs = std::env::var("MAX_REFERENCE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_reference_secs);

        let max_tokens = std::env::var("MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_tokens);

        let max_body_bytes = std::env::var("MAX_BODY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_body_bytes);

        Self {
            port,
            model_dir,
            pipeline_config,
            models,
            request_timeout_secs,
            cors_allowed_origins,
            max_reference_secs,
            max_tokens,
            max_body_bytes,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
