//! Blob format (v1)
//!
//! An [`EncryptedBlob`] is what one `encrypt` call produces. For storage in a
//! vector backend it is rendered as a compact JSON document:
//!
//! ```text
//! {"v":1,"alg":"AES-256-GCM","nonce":"<24 hex>","ct":"<hex ciphertext || tag>"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CipherError;

/// Format version written into every blob.
pub const BLOB_VERSION: u8 = 1;

/// Algorithm identifier (on-document).
pub const ALGORITHM_AES256GCM: &str = "AES-256-GCM";

pub const NONCE_BYTES: usize = 12;
pub const AEAD_TAG_BYTES: usize = 16;
pub const KEY_BYTES: usize = 32;

/// Output of a single encryption: ciphertext (with appended tag), the nonce
/// it was sealed under, and the algorithm/format that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_BYTES],
    pub algorithm: String,
    pub version: u8,
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct BlobDocument {
    v: u8,
    alg: String,
    nonce: String,
    ct: String,
}

impl EncryptedBlob {
    pub(crate) fn sealed(nonce: [u8; NONCE_BYTES], ciphertext: Vec<u8>) -> Self {
        Self {
            ciphertext,
            nonce,
            algorithm: ALGORITHM_AES256GCM.to_string(),
            version: BLOB_VERSION,
        }
    }

    /// Whether this build knows how to open the blob.
    pub fn is_supported(&self) -> bool {
        self.version == BLOB_VERSION && self.algorithm == ALGORITHM_AES256GCM
    }

    /// Render as the opaque document string handed to storage backends.
    pub fn to_document(&self) -> String {
        json!({
            "v": self.version,
            "alg": self.algorithm,
            "nonce": hex::encode(self.nonce),
            "ct": hex::encode(&self.ciphertext),
        })
        .to_string()
    }

    /// Parse a document produced by [`to_document`](Self::to_document).
    ///
    /// Only structure is checked here; version and algorithm are checked at
    /// decrypt time.
    pub fn from_document(doc: &str) -> Result<Self, CipherError> {
        let parsed: BlobDocument = serde_json::from_str(doc)
            .map_err(|e| CipherError::MalformedBlob(format!("document: {}", e)))?;

        let nonce_vec = hex::decode(&parsed.nonce)
            .map_err(|e| CipherError::MalformedBlob(format!("nonce hex: {}", e)))?;
        let nonce: [u8; NONCE_BYTES] = nonce_vec.as_slice().try_into().map_err(|_| {
            CipherError::MalformedBlob(format!(
                "nonce must be {} bytes, got {}",
                NONCE_BYTES,
                nonce_vec.len()
            ))
        })?;

        let ciphertext = hex::decode(&parsed.ct)
            .map_err(|e| CipherError::MalformedBlob(format!("ciphertext hex: {}", e)))?;
        if ciphertext.len() < AEAD_TAG_BYTES {
            return Err(CipherError::MalformedBlob(format!(
                "ciphertext shorter than {}-byte tag",
                AEAD_TAG_BYTES
            )));
        }

        Ok(Self {
            ciphertext,
            nonce,
            algorithm: parsed.alg,
            version: parsed.v,
        })
    }
}
