//! Hybrid metadata encryption.
//!
//! A chunk's metadata is split in two. Allow-listed fields (identifiers,
//! timestamps, structural classification) are stored in the clear so the
//! vector backend can filter on them. Everything else, including any field
//! this module has never heard of, is serialised to JSON and sealed into a
//! single blob stored under [`ENCRYPTED_METADATA_KEY`].

use crate::error::StoreError;
use crate::filter::Filter;
use crate::types::{Metadata, MetadataValue, StoredMetadata};

use enclave_core::{CipherHandle, EncryptedBlob};
use serde_json::Value;
use zeroize::Zeroizing;

pub const ENCRYPTED_METADATA_KEY: &str = "_encrypted_metadata";
pub const HAS_ENCRYPTED_CONTENT_KEY: &str = "_has_encrypted_content";
pub const ENCRYPTION_VERSION_KEY: &str = "_encryption_version";
pub const DECRYPTION_ERROR_KEY: &str = "_decryption_error";

pub const RESERVED_KEYS: [&str; 4] = [
    ENCRYPTED_METADATA_KEY,
    HAS_ENCRYPTED_CONTENT_KEY,
    ENCRYPTION_VERSION_KEY,
    DECRYPTION_ERROR_KEY,
];

/// Version of the sealed-partition format.
pub const METADATA_ENCRYPTION_VERSION: i64 = 1;

/// Stored in the clear and usable in filters.
pub const SEARCHABLE_FIELDS: &[&str] = &[
    "source_id",
    "doc_id",
    "chunk_id",
    "chunk_index",
    "total_chunks",
    "page",
    "created_at",
    "updated_at",
    "ingested_at",
    "timestamp",
    "source_type",
    "content_type",
    "file_type",
    "category",
    "language",
    "trust_level",
    "status",
    "collection",
];

/// Always encrypted. Fields in neither list are encrypted too.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "text",
    "content",
    "title",
    "author",
    "authors",
    "summary",
    "description",
    "user_notes",
    "notes",
    "annotations",
    "comments",
    "tags",
    "keywords",
    "url",
    "source_url",
    "file_path",
    "filename",
    "email",
];

/// Outcome of [`MetadataSplitter::validate_filter`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterValidation {
    /// Referenced fields the backend may see.
    pub valid: Vec<String>,
    /// Referenced fields that are encrypted and must be stripped.
    pub invalid: Vec<String>,
}

impl FilterValidation {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Splits metadata into searchable and sealed partitions, and back.
#[derive(Clone, Debug)]
pub struct MetadataSplitter {
    cipher: CipherHandle,
}

impl MetadataSplitter {
    pub fn new(cipher: CipherHandle) -> Self {
        Self { cipher }
    }

    pub fn is_searchable(&self, field: &str) -> bool {
        SEARCHABLE_FIELDS.contains(&field)
    }

    pub fn searchable_fields(&self) -> &'static [&'static str] {
        SEARCHABLE_FIELDS
    }

    pub fn sensitive_fields(&self) -> &'static [&'static str] {
        SENSITIVE_FIELDS
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Partition and seal. The result holds only allow-listed fields in the
    /// clear plus the reserved bookkeeping keys.
    pub fn prepare_for_storage(&self, metadata: &Metadata) -> Result<StoredMetadata, StoreError> {
        if !self.cipher.is_unlocked() {
            return Err(StoreError::Locked);
        }
        if let Some(key) = metadata.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(StoreError::InvalidMetadata(format!("reserved key {}", key)));
        }

        let mut stored = StoredMetadata::new();
        let mut sealed = Metadata::new();
        for (key, value) in metadata {
            if !self.is_searchable(key) {
                sealed.insert(key.clone(), value.clone());
                continue;
            }
            match MetadataValue::from_json(value) {
                Some(primitive) => {
                    // Composite values are stringified for the backend; keep the
                    // original in the sealed partition so it restores exactly.
                    if primitive.to_json() != *value {
                        sealed.insert(key.clone(), value.clone());
                    }
                    stored.insert(key.clone(), primitive);
                }
                None => {
                    sealed.insert(key.clone(), value.clone());
                }
            }
        }

        let has_sealed = !sealed.is_empty();
        if has_sealed {
            let json = Zeroizing::new(serde_json::to_string(&sealed)?);
            let blob = self.cipher.encrypt_str(&json)?;
            stored.insert(
                ENCRYPTED_METADATA_KEY.to_string(),
                MetadataValue::Str(blob.to_document()),
            );
        }
        stored.insert(HAS_ENCRYPTED_CONTENT_KEY.to_string(), MetadataValue::Bool(has_sealed));
        stored.insert(
            ENCRYPTION_VERSION_KEY.to_string(),
            MetadataValue::Int(METADATA_ENCRYPTION_VERSION),
        );
        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Reverse [`prepare_for_storage`](Self::prepare_for_storage).
    ///
    /// Only a locked session is an error. A sealed partition that fails to
    /// open yields the searchable fields plus `_decryption_error: true`.
    pub fn restore_from_storage(&self, stored: &StoredMetadata) -> Result<Metadata, StoreError> {
        let mut metadata: Metadata = stored
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        let flagged = stored
            .get(HAS_ENCRYPTED_CONTENT_KEY)
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false);
        if !flagged {
            return Ok(metadata);
        }
        if !self.cipher.is_unlocked() {
            return Err(StoreError::Locked);
        }

        match self.open_sealed(stored) {
            Ok(sealed) => metadata.extend(sealed),
            Err(StoreError::Locked) => return Err(StoreError::Locked),
            Err(e) => {
                tracing::warn!(error = %e, "sealed metadata could not be opened");
                metadata.insert(DECRYPTION_ERROR_KEY.to_string(), Value::Bool(true));
            }
        }
        Ok(metadata)
    }

    fn open_sealed(&self, stored: &StoredMetadata) -> Result<Metadata, StoreError> {
        let version = stored.get(ENCRYPTION_VERSION_KEY);
        if version != Some(&MetadataValue::Int(METADATA_ENCRYPTION_VERSION)) {
            return Err(StoreError::InvalidMetadata(
                "unsupported metadata encryption version".into(),
            ));
        }
        let doc = stored
            .get(ENCRYPTED_METADATA_KEY)
            .and_then(MetadataValue::as_str)
            .ok_or_else(|| StoreError::InvalidMetadata("sealed partition missing".into()))?;
        let blob = EncryptedBlob::from_document(doc)?;
        let json = Zeroizing::new(self.cipher.decrypt_to_string(&blob)?);
        Ok(serde_json::from_str(&json)?)
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    /// Which fields referenced by `filter` the backend may see.
    pub fn validate_filter(&self, filter: &Filter) -> FilterValidation {
        let mut result = FilterValidation::default();
        for name in filter.field_names() {
            if self.is_searchable(name) {
                result.valid.push(name.to_string());
            } else {
                result.invalid.push(name.to_string());
            }
        }
        result
    }

    /// Strip every predicate on a non-searchable field.
    ///
    /// Removing a clause from an `$and` widens the match; an `$or` that loses
    /// any clause is dropped whole, since keeping the rest would narrow it.
    /// `None` means nothing is left and the query must run unfiltered.
    pub fn make_searchable_filter(&self, filter: &Filter) -> Option<Filter> {
        let validation = self.validate_filter(filter);
        if !validation.is_clean() {
            tracing::warn!(
                dropped = ?validation.invalid,
                "filter references encrypted fields; predicates removed"
            );
        }
        self.prune(filter)
    }

    fn prune(&self, filter: &Filter) -> Option<Filter> {
        match filter {
            Filter::Field { name, .. } => {
                if self.is_searchable(name) {
                    Some(filter.clone())
                } else {
                    None
                }
            }
            Filter::And(children) => {
                let mut kept: Vec<Filter> = children.iter().filter_map(|c| self.prune(c)).collect();
                match kept.len() {
                    0 => None,
                    1 => kept.pop(),
                    _ => Some(Filter::And(kept)),
                }
            }
            Filter::Or(children) => {
                let kept: Option<Vec<Filter>> = children.iter().map(|c| self.prune(c)).collect();
                let mut kept = kept?;
                match kept.len() {
                    0 => None,
                    1 => kept.pop(),
                    _ => Some(Filter::Or(kept)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Condition;
    use enclave_core::AuthenticatedCipher;
    use serde_json::json;
    use std::sync::Arc;

    fn unlocked() -> (Arc<AuthenticatedCipher>, MetadataSplitter) {
        let cipher = Arc::new(AuthenticatedCipher::new());
        cipher.set_key(&[0x24u8; 32]).unwrap();
        let splitter = MetadataSplitter::new(cipher.handle());
        (cipher, splitter)
    }

    fn metadata(value: Value) -> Metadata {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> Metadata {
        metadata(json!({
            "source_id": "doc1",
            "chunk_index": 4,
            "created_at": "2026-01-02T03:04:05Z",
            "user_notes": "private musings",
            "title": "Quarterly Secrets",
            "mystery_field": {"nested": [1, 2, 3]},
        }))
    }

    #[test]
    fn field_sets_are_disjoint() {
        for field in SEARCHABLE_FIELDS {
            assert!(!SENSITIVE_FIELDS.contains(field), "{} in both sets", field);
        }
    }

    #[test]
    fn roundtrip() {
        let (_cipher, splitter) = unlocked();
        let original = sample();
        let stored = splitter.prepare_for_storage(&original).unwrap();
        assert_eq!(splitter.restore_from_storage(&stored).unwrap(), original);
    }

    #[test]
    fn searchable_partition_hides_sensitive_names_and_values() {
        let (_cipher, splitter) = unlocked();
        let stored = splitter.prepare_for_storage(&sample()).unwrap();

        let visible = serde_json::to_string(&stored).unwrap();
        for secret in ["user_notes", "private musings", "title", "Quarterly Secrets", "mystery_field", "nested"] {
            assert!(!visible.contains(secret), "{} leaked", secret);
        }
        assert_eq!(stored["source_id"], MetadataValue::from("doc1"));
        assert_eq!(stored["chunk_index"], MetadataValue::Int(4));
        assert_eq!(stored[HAS_ENCRYPTED_CONTENT_KEY], MetadataValue::Bool(true));
        assert_eq!(stored[ENCRYPTION_VERSION_KEY], MetadataValue::Int(1));
    }

    #[test]
    fn no_sensitive_fields_means_no_blob() {
        let (_cipher, splitter) = unlocked();
        let original = metadata(json!({"source_id": "a", "page": 2}));
        let stored = splitter.prepare_for_storage(&original).unwrap();
        assert!(!stored.contains_key(ENCRYPTED_METADATA_KEY));
        assert_eq!(stored[HAS_ENCRYPTED_CONTENT_KEY], MetadataValue::Bool(false));
        assert_eq!(splitter.restore_from_storage(&stored).unwrap(), original);
    }

    #[test]
    fn searchable_composites_are_stringified_but_restore_exactly() {
        let (_cipher, splitter) = unlocked();
        let original = metadata(json!({"category": ["a", "b"], "status": null}));
        let stored = splitter.prepare_for_storage(&original).unwrap();
        assert_eq!(stored["category"], MetadataValue::from(r#"["a","b"]"#));
        assert!(!stored.contains_key("status"));
        assert_eq!(splitter.restore_from_storage(&stored).unwrap(), original);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let (_cipher, splitter) = unlocked();
        for key in RESERVED_KEYS {
            let mut m = sample();
            m.insert(key.to_string(), json!(true));
            assert!(matches!(
                splitter.prepare_for_storage(&m),
                Err(StoreError::InvalidMetadata(_))
            ));
        }
    }

    #[test]
    fn locked_cipher_fails_closed() {
        let (cipher, splitter) = unlocked();
        let stored = splitter.prepare_for_storage(&sample()).unwrap();
        cipher.clear_key();
        assert!(matches!(splitter.prepare_for_storage(&sample()), Err(StoreError::Locked)));
        assert!(matches!(splitter.restore_from_storage(&stored), Err(StoreError::Locked)));
    }

    #[test]
    fn tampered_partition_is_flagged_not_raised() {
        let (_cipher, splitter) = unlocked();
        let mut stored = splitter.prepare_for_storage(&sample()).unwrap();
        let doc = stored[ENCRYPTED_METADATA_KEY].as_str().unwrap().to_string();
        let mut value: Value = serde_json::from_str(&doc).unwrap();
        let ct = value["ct"].as_str().unwrap();
        let flipped = format!("{}{}", if ct.starts_with('f') { "0" } else { "f" }, &ct[1..]);
        value["ct"] = Value::String(flipped);
        stored.insert(ENCRYPTED_METADATA_KEY.into(), MetadataValue::Str(value.to_string()));

        let restored = splitter.restore_from_storage(&stored).unwrap();
        assert_eq!(restored[DECRYPTION_ERROR_KEY], json!(true));
        assert_eq!(restored["source_id"], json!("doc1"));
        assert!(!restored.contains_key("user_notes"));
    }

    #[test]
    fn wrong_key_and_bad_version_are_flagged() {
        let (cipher, splitter) = unlocked();
        let stored = splitter.prepare_for_storage(&sample()).unwrap();

        let mut bumped = stored.clone();
        bumped.insert(ENCRYPTION_VERSION_KEY.into(), MetadataValue::Int(2));
        assert_eq!(splitter.restore_from_storage(&bumped).unwrap()[DECRYPTION_ERROR_KEY], json!(true));

        let mut garbled = stored.clone();
        garbled.insert(ENCRYPTED_METADATA_KEY.into(), MetadataValue::from("not a blob"));
        assert_eq!(splitter.restore_from_storage(&garbled).unwrap()[DECRYPTION_ERROR_KEY], json!(true));

        cipher.set_key(&[0x99u8; 32]).unwrap();
        assert_eq!(splitter.restore_from_storage(&stored).unwrap()[DECRYPTION_ERROR_KEY], json!(true));
    }

    #[test]
    fn filter_drops_sensitive_predicates() {
        let (_cipher, splitter) = unlocked();
        let filter = Filter::from_json(&json!({"source_id": "x", "user_notes": "y"})).unwrap();

        let validation = splitter.validate_filter(&filter);
        assert_eq!(validation.valid, vec!["source_id"]);
        assert_eq!(validation.invalid, vec!["user_notes"]);

        assert_eq!(
            splitter.make_searchable_filter(&filter),
            Some(Filter::eq("source_id", "x"))
        );
    }

    #[test]
    fn filter_with_only_sensitive_fields_vanishes() {
        let (_cipher, splitter) = unlocked();
        let filter = Filter::from_json(&json!({"title": "t", "author": {"$ne": "a"}})).unwrap();
        assert_eq!(splitter.make_searchable_filter(&filter), None);
    }

    #[test]
    fn or_losing_a_branch_is_dropped_whole() {
        let (_cipher, splitter) = unlocked();
        let filter = Filter::And(vec![
            Filter::eq("source_type", "pdf"),
            Filter::Or(vec![
                Filter::eq("source_id", "a"),
                Filter::eq("user_notes", "b"),
            ]),
        ]);
        assert_eq!(
            splitter.make_searchable_filter(&filter),
            Some(Filter::eq("source_type", "pdf"))
        );

        let clean_or = Filter::Or(vec![
            Filter::eq("source_id", "a"),
            Filter::field("page", Condition::Gte(2.0)),
        ]);
        assert_eq!(splitter.make_searchable_filter(&clean_or), Some(clean_or.clone()));
    }

    #[test]
    fn unknown_fields_are_not_searchable() {
        let (_cipher, splitter) = unlocked();
        assert!(!splitter.is_searchable("mystery_field"));
        assert!(splitter.is_searchable("source_id"));
        assert!(splitter.sensitive_fields().contains(&"user_notes"));
        assert!(splitter.searchable_fields().contains(&"created_at"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::from),
                "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
            ];
            leaf.prop_recursive(2, 8, 4, |inner| {
                prop::collection::vec(inner, 0..4).prop_map(Value::Array)
            })
        }

        fn key() -> impl Strategy<Value = String> {
            prop_oneof![
                prop::sample::select(SEARCHABLE_FIELDS).prop_map(str::to_string),
                prop::sample::select(SENSITIVE_FIELDS).prop_map(str::to_string),
                "[a-z]{1,8}",
            ]
        }

        proptest! {
            #[test]
            fn restore_inverts_prepare(m in prop::collection::btree_map(key(), value(), 0..8)) {
                let (_cipher, splitter) = unlocked();
                let stored = splitter.prepare_for_storage(&m).unwrap();
                for name in stored.keys() {
                    prop_assert!(!SENSITIVE_FIELDS.contains(&name.as_str()));
                }
                prop_assert_eq!(splitter.restore_from_storage(&stored).unwrap(), m);
            }
        }
    }
}
