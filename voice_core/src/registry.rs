//! Model parameter sets addressed by `name@version`.
//!
//! A model file is JSON of the form `{"config": {...}, "params": {...}}`.
//! Stores only hand out bytes; decoding and shape validation happen here so
//! every failure surfaces as `ModelLoad`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::encoder::{EncoderConfig, EncoderParams, SpeakerEncoder};
use crate::error::{Result, VoiceError};
use crate::frontend::{GriffinLimConfig, MelConfig};
use crate::synthesizer::{DecodePolicy, NeuralSynthesizer, SynthesizerConfig, SynthesizerParams};
use crate::traits::{Embeddable, Synthesizable, Vocodable};
use crate::vocoder::{GriffinLimVocoder, NeuralVocoder, VocoderConfig, VocoderParams};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId {
    pub name: String,
    pub version: String,
}

impl ModelId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for ModelId {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(ModelId::new(name, version))
            }
            _ => Err(VoiceError::model_load(format!(
                "model id '{}' is not of the form name@version",
                s
            ))),
        }
    }
}

/// Source of serialized model files.
pub trait ModelStore: Send + Sync {
    fn fetch(&self, id: &ModelId) -> Result<Vec<u8>>;

    fn list(&self) -> Vec<ModelId>;
}

/// Model files on disk, indexed by a `manifest.json` mapping ids to paths
/// relative to the manifest's directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    entries: BTreeMap<ModelId, PathBuf>,
}

impl DirectoryStore {
    pub const MANIFEST: &'static str = "manifest.json";

    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let manifest_path = root.join(Self::MANIFEST);
        let text = fs::read_to_string(&manifest_path).map_err(|e| {
            VoiceError::model_load(format!("Failed to load {}: {}", manifest_path.display(), e))
        })?;
        let raw: BTreeMap<String, String> = serde_json::from_str(&text).map_err(|e| {
            VoiceError::model_load(format!("{} is not a valid manifest: {}", Self::MANIFEST, e))
        })?;

        let mut entries = BTreeMap::new();
        for (key, path) in raw {
            entries.insert(key.parse::<ModelId>()?, PathBuf::from(path));
        }
        tracing::info!(dir = %root.display(), models = entries.len(), "Opened model directory");
        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModelStore for DirectoryStore {
    fn fetch(&self, id: &ModelId) -> Result<Vec<u8>> {
        let rel = self
            .entries
            .get(id)
            .ok_or_else(|| VoiceError::model_load(format!("model {} is not in the manifest", id)))?;
        let path = self.root.join(rel);
        fs::read(&path)
            .map_err(|e| VoiceError::model_load(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn list(&self) -> Vec<ModelId> {
        self.entries.keys().cloned().collect()
    }
}

/// In-memory model files, mainly for tests and embedding models in a binary.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: DashMap<ModelId, Arc<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ModelId, bytes: Vec<u8>) {
        self.files.insert(id, Arc::new(bytes));
    }

    /// Serialize a `{"config", "params"}` pair under `id`.
    pub fn insert_model<C: Serialize, P: Serialize>(&self, id: ModelId, config: &C, params: &P) -> Result<()> {
        let bytes = serde_json::to_vec(&ModelFileRef { config, params })
            .map_err(|e| VoiceError::model_load(format!("cannot serialize {}: {}", id, e)))?;
        self.insert(id, bytes);
        Ok(())
    }
}

impl ModelStore for MemoryStore {
    fn fetch(&self, id: &ModelId) -> Result<Vec<u8>> {
        self.files
            .get(id)
            .map(|entry| entry.value().as_ref().clone())
            .ok_or_else(|| VoiceError::model_load(format!("model {} is not loaded", id)))
    }

    fn list(&self) -> Vec<ModelId> {
        let mut ids: Vec<ModelId> = self.files.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Deserialize)]
struct ModelFile<C, P> {
    config: C,
    params: P,
}

#[derive(Serialize)]
struct ModelFileRef<'a, C, P> {
    config: &'a C,
    params: &'a P,
}

/// Griffin-Lim "vocoder" files carry only framing and iteration settings.
#[derive(Debug, Deserialize)]
struct GriffinLimFile {
    mel: MelConfig,
    #[serde(default)]
    griffin_lim: GriffinLimConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VocoderFile {
    Neural(ModelFile<VocoderConfig, VocoderParams>),
    GriffinLim(GriffinLimFile),
}

fn decode<T: DeserializeOwned>(store: &dyn ModelStore, id: &ModelId) -> Result<T> {
    let bytes = store.fetch(id)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VoiceError::model_load(format!("model {} is malformed: {}", id, e)))
}

pub fn load_encoder(store: &dyn ModelStore, id: &ModelId) -> Result<SpeakerEncoder> {
    let file: ModelFile<EncoderConfig, EncoderParams> = decode(store, id)?;
    tracing::info!(model = %id, "Loading speaker encoder");
    SpeakerEncoder::new(file.config, file.params)
}

pub fn load_synthesizer(store: &dyn ModelStore, id: &ModelId, policy: DecodePolicy) -> Result<NeuralSynthesizer> {
    let file: ModelFile<SynthesizerConfig, SynthesizerParams> = decode(store, id)?;
    tracing::info!(model = %id, "Loading synthesizer");
    NeuralSynthesizer::new(file.config, file.params, policy)
}

pub fn load_vocoder(store: &dyn ModelStore, id: &ModelId) -> Result<Arc<dyn Vocodable>> {
    tracing::info!(model = %id, "Loading vocoder");
    match decode::<VocoderFile>(store, id)? {
        VocoderFile::Neural(file) => Ok(Arc::new(NeuralVocoder::new(file.config, file.params)?)),
        VocoderFile::GriffinLim(file) => Ok(Arc::new(GriffinLimVocoder::new(file.mel, file.griffin_lim)?)),
    }
}

/// Which model files make up a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineModels {
    pub encoder: ModelId,
    pub synthesizer: ModelId,
    pub vocoder: ModelId,
}

/// The three stages, loaded and ready to be wired together.
pub struct LoadedModels {
    pub encoder: Arc<dyn Embeddable>,
    pub synthesizer: Arc<dyn Synthesizable>,
    pub vocoder: Arc<dyn Vocodable>,
}

pub fn load_models(store: &dyn ModelStore, models: &PipelineModels, policy: DecodePolicy) -> Result<LoadedModels> {
    Ok(LoadedModels {
        encoder: Arc::new(load_encoder(store, &models.encoder)?),
        synthesizer: Arc::new(load_synthesizer(store, &models.synthesizer, policy)?),
        vocoder: load_vocoder(store, &models.vocoder)?,
    })
}
