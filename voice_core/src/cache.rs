//! Speaker embedding cache keyed by reference audio content.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::{SpeakerEmbedding, Waveform};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

/// Content fingerprint of a reference: SHA-256 over the sample rate and the
/// raw sample bits, hex encoded. Identical audio always maps to the same key.
pub fn fingerprint(waveform: &Waveform) -> String {
    let mut hasher = Sha256::new();
    hasher.update(waveform.sample_rate().to_le_bytes());
    for s in waveform.samples() {
        hasher.update(s.to_bits().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Bounded LRU of embeddings.
///
/// Lookups take the read lock and `peek`; only a hit's recency update and
/// inserts take the write lock. Concurrent misses on the same key queue on a
/// per-key slot, so the embedding is computed once and the others hit.
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: Option<RwLock<LruCache<String, Arc<SpeakerEmbedding>>>>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = if config.enabled {
            NonZeroUsize::new(config.max_entries).map(|cap| RwLock::new(LruCache::new(cap)))
        } else {
            None
        };
        Self {
            entries,
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn get(&self, key: &str) -> Option<Arc<SpeakerEmbedding>> {
        let entries = self.entries.as_ref()?;
        let found = {
            let cache = entries.read().unwrap_or_else(|e| e.into_inner());
            cache.peek(key).cloned()
        };
        if found.is_some() {
            let mut cache = entries.write().unwrap_or_else(|e| e.into_inner());
            cache.promote(key);
        }
        found
    }

    pub fn insert(&self, key: String, embedding: Arc<SpeakerEmbedding>) {
        if let Some(entries) = &self.entries {
            let mut cache = entries.write().unwrap_or_else(|e| e.into_inner());
            let replacing = cache.contains(&key);
            if let Some((evicted, _)) = cache.push(key, embedding) {
                if !replacing {
                    tracing::debug!(key = %evicted, "Evicted cached speaker embedding");
                }
            }
        }
    }

    /// Cached embedding for `waveform`, computing it with `embed` on a miss.
    pub fn get_or_embed<F>(&self, waveform: &Waveform, embed: F) -> Result<Arc<SpeakerEmbedding>>
    where
        F: FnOnce() -> Result<SpeakerEmbedding>,
    {
        if !self.is_enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return embed().map(Arc::new);
        }

        let key = fingerprint(waveform);
        if let Some(hit) = self.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %&key[..12], "Speaker embedding cache hit");
            return Ok(hit);
        }

        let slot = self.inflight.entry(key.clone()).or_default().clone();
        let result = {
            let _turn = slot.lock().unwrap_or_else(|e| e.into_inner());
            self.embed_once(&key, embed)
        };
        // Last one out removes the slot; the map and `slot` hold one reference each
        self.inflight
            .remove_if(&key, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    /// Runs with the key's slot held: another caller may have filled the entry meanwhile.
    fn embed_once<F>(&self, key: &str, embed: F) -> Result<Arc<SpeakerEmbedding>>
    where
        F: FnOnce() -> Result<SpeakerEmbedding>,
    {
        if let Some(hit) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %&key[..12], "Speaker embedding computed by a concurrent caller");
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %&key[..12], "Speaker embedding cache miss");
        let embedding = Arc::new(embed()?);
        self.insert(key.to_string(), embedding.clone());
        Ok(embedding)
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|e| e.read().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.write().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self
                .entries
                .as_ref()
                .map(|e| e.read().unwrap_or_else(|e| e.into_inner()).cap().get())
                .unwrap_or(0),
        }
    }
}
