//! Vector backends: where encrypted chunks and their embeddings live.

use crate::error::StoreError;
use crate::filter::Filter;
use crate::types::StoredMetadata;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// One record as the backend stores it. `document` is an opaque
/// [`EncryptedBlob`](enclave_core::EncryptedBlob) document.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub document: String,
    pub metadata: StoredMetadata,
    pub embedding: Vec<f32>,
}

/// A similarity hit, nearest first.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryHit {
    pub id: String,
    pub document: String,
    pub metadata: StoredMetadata,
    pub distance: f32,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// The similarity store the encrypted store writes through.
///
/// Implementations never see plaintext content or sensitive metadata; they
/// index the embedding and filter on the searchable fields only.
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace by id.
    fn add(&self, chunk: StoredChunk) -> Result<(), StoreError>;

    fn add_batch(&self, chunks: Vec<StoredChunk>) -> Result<(), StoreError> {
        for chunk in chunks {
            self.add(chunk)?;
        }
        Ok(())
    }

    fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>, StoreError>;

    fn get(&self, id: &str) -> Result<Option<StoredChunk>, StoreError>;

    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Brute-force squared-L2 search over an in-memory map.
pub struct InMemoryVectorBackend {
    name: String,
    chunks: RwLock<BTreeMap<String, StoredChunk>>,
    batch_writes: AtomicUsize,
}

impl InMemoryVectorBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunks: RwLock::new(BTreeMap::new()),
            batch_writes: AtomicUsize::new(0),
        }
    }

    /// Number of `add_batch` calls received.
    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::Relaxed)
    }

    /// Raw access for inspection and fault injection in tests.
    pub fn raw(&self, id: &str) -> Option<StoredChunk> {
        self.read().get(id).cloned()
    }

    pub fn replace_raw(&self, chunk: StoredChunk) {
        self.write().insert(chunk.id.clone(), chunk);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredChunk>> {
        self.chunks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, StoredChunk>> {
        self.chunks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_dimension(
        map: &BTreeMap<String, StoredChunk>,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        if embedding.is_empty() {
            return Err(StoreError::Backend("empty embedding".into()));
        }
        match map.values().next() {
            Some(existing) if existing.embedding.len() != embedding.len() => {
                Err(StoreError::Backend(format!(
                    "embedding dimension {} does not match collection dimension {}",
                    embedding.len(),
                    existing.embedding.len()
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Default for InMemoryVectorBackend {
    fn default() -> Self {
        Self::new("default")
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl VectorBackend for InMemoryVectorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, chunk: StoredChunk) -> Result<(), StoreError> {
        let mut map = self.write();
        Self::check_dimension(&map, &chunk.embedding)?;
        map.insert(chunk.id.clone(), chunk);
        Ok(())
    }

    /// All-or-nothing under one write lock.
    fn add_batch(&self, chunks: Vec<StoredChunk>) -> Result<(), StoreError> {
        self.batch_writes.fetch_add(1, Ordering::Relaxed);
        let mut map = self.write();
        let dim = map
            .values()
            .next()
            .map(|c| c.embedding.len())
            .or_else(|| chunks.first().map(|c| c.embedding.len()));
        for chunk in &chunks {
            if chunk.embedding.is_empty() || Some(chunk.embedding.len()) != dim {
                return Err(StoreError::Backend(format!(
                    "embedding dimension mismatch for {}",
                    chunk.id
                )));
            }
        }
        for chunk in chunks {
            map.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryHit>, StoreError> {
        let map = self.read();
        if !map.is_empty() {
            Self::check_dimension(&map, embedding)?;
        }
        let mut hits: Vec<QueryHit> = map
            .values()
            .filter(|c| filter.map_or(true, |f| f.matches(&c.metadata)))
            .map(|c| QueryHit {
                id: c.id.clone(),
                document: c.document.clone(),
                metadata: c.metadata.clone(),
                distance: squared_l2(embedding, &c.embedding),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    fn get(&self, id: &str) -> Result<Option<StoredChunk>, StoreError> {
        Ok(self.read().get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.write().remove(id).is_some())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read().len())
    }
}
