//! Endpoint pattern registry: insert-or-update by normalized key, persisted
//! as one JSON document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pagetap_protocol::{Capture, DataCategory, EndpointPattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalize::NormalizedEndpoint;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported registry document version {0}")]
    Version(u32),
}

/// Outcome of [`EndpointRegistry::observe`].
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// First sighting of this key.
    Discovered(EndpointPattern),
    /// Known key; counters were updated.
    Seen { key: String, use_count: u64 },
}

impl Observation {
    pub fn key(&self) -> &str {
        match self {
            Observation::Discovered(pattern) => &pattern.normalized_key,
            Observation::Seen { key, .. } => key,
        }
    }

    pub fn is_discovery(&self) -> bool {
        matches!(self, Observation::Discovered(_))
    }
}

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    patterns: Vec<EndpointPattern>,
}

/// On-disk home of the registry.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all patterns. A missing file is an empty registry.
    pub fn load(&self) -> Result<Vec<EndpointPattern>, PersistenceError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: RegistryDocument = serde_json::from_slice(&raw)?;
        if doc.version != DOCUMENT_VERSION {
            return Err(PersistenceError::Version(doc.version));
        }
        Ok(doc.patterns)
    }

    pub fn save<'a>(
        &self,
        patterns: impl IntoIterator<Item = &'a EndpointPattern>,
    ) -> Result<(), PersistenceError> {
        self.prepare(patterns)?.commit()
    }

    /// Serialize now; write later with [`PendingWrite::commit`].
    pub fn prepare<'a>(
        &self,
        patterns: impl IntoIterator<Item = &'a EndpointPattern>,
    ) -> Result<PendingWrite, PersistenceError> {
        let doc = RegistryDocument {
            version: DOCUMENT_VERSION,
            saved_at: Utc::now(),
            patterns: patterns.into_iter().cloned().collect(),
        };
        Ok(PendingWrite {
            path: self.path.clone(),
            endpoints: doc.patterns.len(),
            json: serde_json::to_vec_pretty(&doc)?,
        })
    }
}

/// A serialized registry document not yet on disk.
#[derive(Debug)]
pub struct PendingWrite {
    path: PathBuf,
    endpoints: usize,
    json: Vec<u8>,
}

impl PendingWrite {
    pub fn endpoints(&self) -> usize {
        self.endpoints
    }

    /// Blocking file I/O.
    pub fn commit(self) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&self.path, &self.json)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// In-memory registry. Not synchronized; the relay wraps it in a mutex.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    patterns: BTreeMap<String, EndpointPattern>,
    store: Option<RegistryStore>,
    dirty: bool,
}

impl EndpointRegistry {
    /// A registry that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `store`. A corrupt document is logged and replaced by an
    /// empty registry on the next flush.
    pub fn open(store: RegistryStore) -> Self {
        let patterns = match store.load() {
            Ok(patterns) => patterns,
            Err(e) => {
                tracing::warn!(
                    path = %store.path().display(),
                    error = %e,
                    "endpoint registry unreadable, starting empty"
                );
                Vec::new()
            }
        };
        tracing::info!(
            path = %store.path().display(),
            endpoints = patterns.len(),
            "endpoint registry loaded"
        );
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| (p.normalized_key.clone(), p))
                .collect(),
            store: Some(store),
            dirty: false,
        }
    }

    /// Record one capture resolved to `endpoint`.
    pub fn observe(
        &mut self,
        endpoint: &NormalizedEndpoint,
        capture: &Capture,
        category: DataCategory,
    ) -> Observation {
        self.dirty = true;
        if let Some(existing) = self.patterns.get_mut(&endpoint.key) {
            existing.touch(capture.captured_at);
            // A later, more specific classification replaces an unknown one.
            if existing.data_category == DataCategory::Unknown && category != DataCategory::Unknown
            {
                existing.data_category = category;
            }
            return Observation::Seen {
                key: endpoint.key.clone(),
                use_count: existing.use_count,
            };
        }

        let mut pattern = EndpointPattern::new(
            endpoint.key.clone(),
            capture.url.clone(),
            capture.method.clone(),
            category,
            capture.captured_at,
        );
        pattern.query_params = endpoint.param_names().map(String::from).collect();
        self.patterns.insert(endpoint.key.clone(), pattern.clone());
        tracing::info!(key = %endpoint.key, category = %category, "endpoint discovered");
        Observation::Discovered(pattern)
    }

    /// Attach an inferred schema to a known key.
    pub fn set_schema(&mut self, key: &str, schema: serde_json::Value) -> bool {
        match self.patterns.get_mut(key) {
            Some(pattern) => {
                pattern.inferred_schema = Some(schema);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&EndpointPattern> {
        self.patterns.get(key)
    }

    /// All patterns, ordered by key.
    pub fn list(&self) -> Vec<EndpointPattern> {
        self.patterns.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write to the store if anything changed. Returns whether a write happened.
    pub fn flush(&mut self) -> Result<bool, PersistenceError> {
        let Some(write) = self.take_write()? else {
            return Ok(false);
        };
        if let Err(e) = write.commit() {
            self.mark_dirty();
            return Err(e);
        }
        tracing::debug!(endpoints = self.patterns.len(), "endpoint registry flushed");
        Ok(true)
    }

    /// Serialize pending changes and mark the registry clean. The caller
    /// commits the write, off the async workers, and calls
    /// [`Self::mark_dirty`] if that fails.
    pub fn take_write(&mut self) -> Result<Option<PendingWrite>, PersistenceError> {
        let Some(store) = &self.store else {
            self.dirty = false;
            return Ok(None);
        };
        if !self.dirty {
            return Ok(None);
        }
        let write = store.prepare(self.patterns.values())?;
        self.dirty = false;
        Ok(Some(write))
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}
