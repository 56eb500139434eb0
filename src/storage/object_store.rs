//! Object storage (C1): the uniform envelope over inline/external/collection
//! values.
//!
//! ## Rust Learning Notes
//!
//! `ObjectStore` is an `async_trait` in the repository-trait style: a
//! `Send + Sync` trait object behind `Arc<dyn ObjectStore>` lets the scheduler and runner
//! depend on "a place to put large values" without caring whether that's an
//! in-memory map (tests, the `executor` demo) or a real bucket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreConfig;
use crate::error::{CoreError, Result};
use crate::model::StoredObject;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Serializes `value`; externalizes it under `key` if it's larger than
    /// the configured threshold, otherwise returns it inline.
    async fn store(&self, key: &str, value: &Value, typename: &str) -> Result<StoredObject>;

    /// Stores raw bytes (a tarball, any other binary blob) under `key`.
    /// Always externalizes — binary content has no meaningful inline JSON
    /// form, unlike `store`'s small-value fast path.
    async fn store_bytes(&self, key: &str, bytes: &[u8]) -> Result<StoredObject>;

    /// Resolves any [`StoredObject`] back into raw JSON. Collections are
    /// expanded into an in-order array unless `index` narrows to one
    /// element.
    async fn retrieve(&self, object: &StoredObject) -> Result<Value>;

    /// Persists an ordered list of already-stored element references as a
    /// single addressable collection.
    async fn store_collection(
        &self,
        key_prefix: &str,
        elements: Vec<StoredObject>,
    ) -> Result<StoredObject>;

    /// Returns the handle for a single collection element without
    /// materializing the rest of the collection.
    async fn collection_at(&self, object: &StoredObject, index: usize) -> Result<StoredObject>;
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// An in-process object store backed by a concurrent map, keyed by
/// `bucket/key`. Sufficient for the `executor` demo binary and for tests;
/// a real deployment swaps this for an S3-backed implementation behind the
/// same trait.
pub struct InMemoryObjectStore {
    config: ObjectStoreConfig,
    blobs: DashMap<String, (Vec<u8>, String)>,
    collections: DashMap<String, Vec<StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new(config: ObjectStoreConfig) -> Self {
        Self {
            config,
            blobs: DashMap::new(),
            collections: DashMap::new(),
        }
    }

    fn blob_address(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn store(&self, key: &str, value: &Value, typename: &str) -> Result<StoredObject> {
        let serialized = serde_json::to_vec(value)?;
        if serialized.len() <= self.config.externalize_threshold_bytes {
            return Ok(StoredObject::Inline {
                data: value.clone(),
                typename: typename.to_string(),
            });
        }

        let sha256 = sha256_hex(&serialized);
        let size = serialized.len() as u64;
        let address = Self::blob_address(&self.config.bucket, key);
        self.blobs.insert(address, (serialized, sha256.clone()));
        Ok(StoredObject::External {
            bucket: self.config.bucket.clone(),
            key: key.to_string(),
            sha256,
            size,
        })
    }

    async fn store_bytes(&self, key: &str, bytes: &[u8]) -> Result<StoredObject> {
        let sha256 = sha256_hex(bytes);
        let size = bytes.len() as u64;
        let address = Self::blob_address(&self.config.bucket, key);
        self.blobs.insert(address, (bytes.to_vec(), sha256.clone()));
        Ok(StoredObject::External {
            bucket: self.config.bucket.clone(),
            key: key.to_string(),
            sha256,
            size,
        })
    }

    async fn retrieve(&self, object: &StoredObject) -> Result<Value> {
        match object {
            StoredObject::Inline { data, .. } => Ok(data.clone()),
            StoredObject::External {
                bucket, key, sha256, ..
            } => {
                let address = Self::blob_address(bucket, key);
                let (bytes, stored_sha) = self
                    .blobs
                    .get(&address)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| CoreError::NotFound(address.clone()))?;
                if &stored_sha != sha256 {
                    return Err(CoreError::IntegrityError(address));
                }
                Ok(serde_json::from_slice(&bytes)?)
            }
            StoredObject::Collection { key_prefix, length, .. } => {
                let elements = self
                    .collections
                    .get(key_prefix)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| CoreError::NotFound(key_prefix.clone()))?;
                let mut values = Vec::with_capacity(*length);
                for element in &elements {
                    values.push(self.retrieve(element).await?);
                }
                Ok(Value::Array(values))
            }
        }
    }

    async fn store_collection(
        &self,
        key_prefix: &str,
        elements: Vec<StoredObject>,
    ) -> Result<StoredObject> {
        let length = elements.len();
        let element_kind = elements
            .first()
            .map(describe_kind)
            .unwrap_or_else(|| "unknown".to_string());
        self.collections.insert(key_prefix.to_string(), elements);
        Ok(StoredObject::Collection {
            key_prefix: key_prefix.to_string(),
            length,
            element_kind,
        })
    }

    async fn collection_at(&self, object: &StoredObject, index: usize) -> Result<StoredObject> {
        match object {
            StoredObject::Collection { key_prefix, length, .. } => {
                if index >= *length {
                    return Err(CoreError::NotFound(format!("{key_prefix}/{index}")));
                }
                let elements = self
                    .collections
                    .get(key_prefix)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| CoreError::NotFound(key_prefix.clone()))?;
                Ok(elements[index].clone())
            }
            other => Err(CoreError::Validation(format!(
                "collection_at called on non-collection object: {other:?}"
            ))),
        }
    }
}

fn describe_kind(object: &StoredObject) -> String {
    match object {
        StoredObject::Inline { typename, .. } => typename.clone(),
        StoredObject::External { .. } => "external".to_string(),
        StoredObject::Collection { element_kind, .. } => format!("collection<{element_kind}>"),
    }
}

/// Convenience helper used by the materialization pass: store an arbitrary
/// serializable value, inferring its JSON typename.
pub async fn store_value<T: Serialize>(
    store: &Arc<dyn ObjectStore>,
    key: &str,
    value: &T,
) -> Result<StoredObject> {
    let json = serde_json::to_value(value)?;
    let typename = json_typename(&json);
    store.store(key, &json, typename).await
}

fn json_typename(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryObjectStore {
        InMemoryObjectStore::new(ObjectStoreConfig {
            externalize_threshold_bytes: 16,
            bucket: "test-bucket".to_string(),
        })
    }

    #[tokio::test]
    async fn small_values_stay_inline() {
        let store = store();
        let result = store.store("k", &Value::Bool(true), "bool").await.unwrap();
        assert!(result.is_inline());
    }

    #[tokio::test]
    async fn large_values_externalize_and_round_trip() {
        let store = store();
        let value = Value::String("x".repeat(100));
        let stored = store.store("big", &value, "string").await.unwrap();
        assert!(!stored.is_inline());
        let retrieved = store.retrieve(&stored).await.unwrap();
        assert_eq!(retrieved, value);
    }

    #[tokio::test]
    async fn retrieve_detects_tampered_content() {
        let store = store();
        let value = Value::String("x".repeat(100));
        let stored = store.store("big", &value, "string").await.unwrap();
        if let StoredObject::External { bucket, key, .. } = &stored {
            let address = InMemoryObjectStore::blob_address(bucket, key);
            store.blobs.insert(address, (b"{}".to_vec(), "deadbeef".to_string()));
        }
        assert!(matches!(
            store.retrieve(&stored).await,
            Err(CoreError::IntegrityError(_))
        ));
    }

    #[tokio::test]
    async fn collections_address_individual_elements() {
        let store = store();
        let elements = vec![
            StoredObject::inline(Value::from(1), "number"),
            StoredObject::inline(Value::from(2), "number"),
        ];
        let collection = store.store_collection("run/items", elements).await.unwrap();
        let first = store.collection_at(&collection, 0).await.unwrap();
        assert_eq!(store.retrieve(&first).await.unwrap(), Value::from(1));
        assert!(store.collection_at(&collection, 5).await.is_err());
    }

    #[tokio::test]
    async fn retrieve_expands_collections_in_order() {
        let store = store();
        let elements = vec![
            StoredObject::inline(Value::from(1), "number"),
            StoredObject::inline(Value::from(2), "number"),
        ];
        let collection = store.store_collection("run/items", elements).await.unwrap();
        let value = store.retrieve(&collection).await.unwrap();
        assert_eq!(value, Value::Array(vec![Value::from(1), Value::from(2)]));
    }
}
