//! Voice cloning inference core.
//!
//! A reference utterance is reduced to a speaker embedding, text tokens are
//! decoded into mel frames conditioned on that embedding, and the frames are
//! vocoded into audio, either in one piece or as an ordered chunk stream.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frontend;
pub mod nn;
pub mod pipeline;
pub mod registry;
pub mod streaming;
pub mod synthesizer;
pub mod text;
pub mod traits;
pub mod types;
pub mod vocoder;

pub use cache::{fingerprint, CacheConfig, CacheStats, EmbeddingCache};
pub use cancel::CancelToken;
pub use config::{PipelineConfig, StreamingConfig};
pub use encoder::{EncoderConfig, EncoderParams, SpeakerEncoder, UtteranceEmbedding};
pub use error::{Result, VoiceError};
pub use frontend::{FeatureFrontend, FeatureScale, GriffinLimConfig, MelConfig};
pub use pipeline::{DeliveryMode, SpeechOutput, VoicePipeline};
pub use registry::{DirectoryStore, MemoryStore, ModelId, ModelStore, PipelineModels};
pub use streaming::{ChunkStream, StreamResources};
pub use synthesizer::{
    DecodePhase, DecodePolicy, MonotonicityPolicy, NeuralSynthesizer, SynthesisReport,
    SynthesizerConfig, SynthesizerParams,
};
pub use text::{Segment, SegmentConfig, TextSequence};
pub use traits::{Embeddable, Synthesizable, Vocodable};
pub use types::{AcousticFeatures, AudioChunk, SpeakerEmbedding, Waveform};
pub use vocoder::{
    GriffinLimVocoder, NeuralVocoder, StreamWindowing, StreamingVocoder, VocoderConfig,
    VocoderParams, VocoderStream,
};
