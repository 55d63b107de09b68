//! Encrypted chunk store: content and sensitive metadata are sealed before
//! they reach the vector backend, embeddings pass through in the clear.

use crate::backend::{StoredChunk, VectorBackend};
use crate::error::StoreError;
use crate::filter::Filter;
use crate::metadata::{MetadataSplitter, DECRYPTION_ERROR_KEY};
use crate::types::{Metadata, StoredMetadata};

use enclave_core::{CipherError, CipherHandle, EncryptedBlob, ALGORITHM_AES256GCM};
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Inputs and results
// ---------------------------------------------------------------------------

/// A chunk to be written by [`EncryptedStore::add_chunks`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewChunk {
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    /// Generated (UUID v4) when absent.
    pub id: Option<String>,
}

impl NewChunk {
    pub fn new(content: impl Into<String>, metadata: Metadata, embedding: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            metadata,
            embedding,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A fully decrypted chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedChunk {
    pub content: String,
    pub metadata: Metadata,
}

/// A record that could not be opened. `metadata` holds whatever was
/// recoverable, at least the searchable fields.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordError {
    pub reason: String,
    pub metadata: Metadata,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "record unreadable: {}", self.reason)
    }
}

impl std::error::Error for RecordError {}

/// One row of a query or lookup. Per-record failures live inside `chunk`
/// so one bad record never hides the others.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkResult {
    pub id: String,
    /// Squared L2 distance for query hits, `None` for lookups by id.
    pub distance: Option<f32>,
    pub chunk: Result<DecryptedChunk, RecordError>,
}

impl ChunkResult {
    pub fn is_ok(&self) -> bool {
        self.chunk.is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub count: usize,
    pub searchable_fields: Vec<String>,
    pub encrypted_fields: Vec<String>,
    pub unlocked: bool,
    pub algorithm: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct EncryptedStore {
    cipher: CipherHandle,
    splitter: MetadataSplitter,
    backend: Arc<dyn VectorBackend>,
}

impl EncryptedStore {
    pub fn new(cipher: CipherHandle, backend: Arc<dyn VectorBackend>) -> Self {
        Self {
            splitter: MetadataSplitter::new(cipher.clone()),
            cipher,
            backend,
        }
    }

    pub fn splitter(&self) -> &MetadataSplitter {
        &self.splitter
    }

    fn ensure_unlocked(&self) -> Result<(), StoreError> {
        if self.cipher.is_unlocked() {
            Ok(())
        } else {
            Err(StoreError::Locked)
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Seal and store one chunk. Returns its id.
    pub fn add_chunk(
        &self,
        content: &str,
        metadata: &Metadata,
        embedding: Vec<f32>,
        id: Option<String>,
    ) -> Result<String, StoreError> {
        self.ensure_unlocked()?;
        let chunk = self.seal(content, metadata, embedding, id)?;
        let id = chunk.id.clone();
        self.backend.add(chunk)?;
        tracing::debug!(id = %id, backend = self.backend.name(), "chunk stored");
        Ok(id)
    }

    /// Seal every chunk, then hand them to the backend in one batch.
    /// Nothing is written if any chunk fails to seal.
    pub fn add_chunks(&self, chunks: Vec<NewChunk>) -> Result<Vec<String>, StoreError> {
        self.ensure_unlocked()?;
        let sealed = chunks
            .into_iter()
            .map(|c| self.seal(&c.content, &c.metadata, c.embedding, c.id))
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = sealed.iter().map(|c| c.id.clone()).collect();
        self.backend.add_batch(sealed)?;
        tracing::debug!(count = ids.len(), backend = self.backend.name(), "chunk batch stored");
        Ok(ids)
    }

    fn seal(
        &self,
        content: &str,
        metadata: &Metadata,
        embedding: Vec<f32>,
        id: Option<String>,
    ) -> Result<StoredChunk, StoreError> {
        let document = self.cipher.encrypt_str(content)?.to_document();
        let metadata = self.splitter.prepare_for_storage(metadata)?;
        Ok(StoredChunk {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            document,
            metadata,
            embedding,
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Nearest `k` chunks to `embedding`.
    ///
    /// Predicates on encrypted fields are stripped from `filter` first; if
    /// none survive, the query runs unfiltered. Locking mid-query aborts the
    /// whole call with `Locked`.
    pub fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ChunkResult>, StoreError> {
        self.ensure_unlocked()?;
        let sanitized = filter.and_then(|f| self.splitter.make_searchable_filter(f));
        if filter.is_some() && sanitized.is_none() {
            tracing::debug!("no searchable predicates left, querying unfiltered");
        }

        let hits = self.backend.query(embedding, k, sanitized.as_ref())?;
        hits.into_iter()
            .map(|hit| -> Result<ChunkResult, StoreError> {
                let chunk = self.open(&hit.id, &hit.document, &hit.metadata)?;
                Ok(ChunkResult {
                    id: hit.id,
                    distance: Some(hit.distance),
                    chunk,
                })
            })
            .collect()
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<ChunkResult>, StoreError> {
        self.ensure_unlocked()?;
        let Some(stored) = self.backend.get(id)? else {
            return Ok(None);
        };
        let chunk = self.open(&stored.id, &stored.document, &stored.metadata)?;
        Ok(Some(ChunkResult {
            id: stored.id,
            distance: None,
            chunk,
        }))
    }

    /// Returns whether a chunk was removed.
    pub fn delete_by_id(&self, id: &str) -> Result<bool, StoreError> {
        self.ensure_unlocked()?;
        let removed = self.backend.delete(id)?;
        tracing::debug!(id = %id, removed, "chunk delete");
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.ensure_unlocked()?;
        self.backend.count()
    }

    /// Shape of the collection. Available while locked; reveals no content.
    pub fn collection_info(&self) -> Result<CollectionInfo, StoreError> {
        Ok(CollectionInfo {
            name: self.backend.name().to_string(),
            count: self.backend.count()?,
            searchable_fields: self.splitter.searchable_fields().iter().map(|s| s.to_string()).collect(),
            encrypted_fields: self.splitter.sensitive_fields().iter().map(|s| s.to_string()).collect(),
            unlocked: self.cipher.is_unlocked(),
            algorithm: ALGORITHM_AES256GCM.to_string(),
        })
    }

    /// Decrypt one record. The outer `Err` is reserved for `Locked`.
    fn open(
        &self,
        id: &str,
        document: &str,
        stored: &StoredMetadata,
    ) -> Result<Result<DecryptedChunk, RecordError>, StoreError> {
        let metadata = self.splitter.restore_from_storage(stored)?;

        let content = EncryptedBlob::from_document(document)
            .and_then(|blob| self.cipher.decrypt_to_string(&blob));
        let content = match content {
            Ok(content) => content,
            Err(CipherError::Locked) => return Err(StoreError::Locked),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "chunk content could not be decrypted");
                return Ok(Err(RecordError {
                    reason: e.to_string(),
                    metadata,
                }));
            }
        };

        if metadata.contains_key(DECRYPTION_ERROR_KEY) {
            return Ok(Err(RecordError {
                reason: "sealed metadata could not be decrypted".into(),
                metadata,
            }));
        }
        Ok(Ok(DecryptedChunk { content, metadata }))
    }
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("backend", &self.backend.name())
            .field("unlocked", &self.cipher.is_unlocked())
            .finish()
    }
}
