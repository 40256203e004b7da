use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use voice_core::{DirectoryStore, ModelStore, PipelineConfig, VoicePipeline};
use voice_server::{build_router, config::ServerConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting voice cloning server...");
    let config = ServerConfig::from_env();

    let pipeline_config = match &config.pipeline_config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load pipeline config {}", path.display()))?
            .with_env_overrides(),
        None => PipelineConfig::from_env(),
    };

    info!("Loading models from {}", config.model_dir.display());
    let store = DirectoryStore::open(&config.model_dir)
        .with_context(|| format!("Failed to open model directory {}", config.model_dir.display()))?;
    let pipeline = VoicePipeline::load(&store, &config.models, pipeline_config).with_context(|| {
        format!(
            "Failed to load models {}, {}, {}",
            config.models.encoder, config.models.synthesizer, config.models.vocoder
        )
    })?;
    info!(
        "Pipeline ready: {} Hz output, {}-d speaker embeddings",
        pipeline.sample_rate(),
        pipeline.embedding_dim()
    );

    let state = AppState::new(pipeline, config.models.clone(), store.list(), config.clone());
    info!(
        "Server configuration loaded: port={}, request_timeout={}s, max_reference={}s",
        config.port, config.request_timeout_secs, config.max_reference_secs
    );
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT."))?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
