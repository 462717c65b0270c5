//! Storage backends for ReportStore

use crate::{document_id, BlobInfo, BlobObject, Bucket, Collection, Document, StoreBackend, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use ra_types::ObjectId;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

const TREE_IDX_IDENTIFIER: &str = "idx_containers_identifier";

#[derive(Default)]
struct MemCollection {
    docs: Vec<Document>,
    ids: HashSet<String>,
}

/// In-memory backend for development and testing
pub struct InMemoryBackend {
    collections: Arc<RwLock<HashMap<Collection, MemCollection>>>,
    blobs: Arc<RwLock<HashMap<(Bucket, ObjectId), BlobObject>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            blobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for InMemoryBackend {
    async fn insert_one(
        &self,
        collection: Collection,
        document: Document,
    ) -> Result<(), StoreError> {
        self.insert_many(collection, vec![document]).await
    }

    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let col = collections.entry(collection).or_default();

        let mut batch_ids = HashSet::with_capacity(documents.len());
        for doc in &documents {
            let id = document_id(doc)?;
            if col.ids.contains(&id) || !batch_ids.insert(id.clone()) {
                return Err(StoreError::Duplicate {
                    collection: collection.name().to_string(),
                    id,
                });
            }
        }

        col.ids.extend(batch_ids);
        col.docs.extend(documents);
        Ok(())
    }

    async fn find_one(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(&collection).and_then(|col| {
            col.docs
                .iter()
                .find(|doc| doc.get(field) == Some(value))
                .cloned()
        }))
    }

    async fn delete_many(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<usize, StoreError> {
        let mut collections = self.collections.write().await;
        let Some(col) = collections.get_mut(&collection) else {
            return Ok(0);
        };

        let before = col.docs.len();
        let mut removed_ids = Vec::new();
        col.docs.retain(|doc| {
            if doc.get(field) == Some(value) {
                if let Ok(id) = document_id(doc) {
                    removed_ids.push(id);
                }
                false
            } else {
                true
            }
        });
        for id in removed_ids {
            col.ids.remove(&id);
        }
        Ok(before - col.docs.len())
    }

    async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(&collection).map_or(0, |c| c.docs.len()))
    }

    async fn put_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(&(bucket, id)) {
            return Err(StoreError::Duplicate {
                collection: bucket.name().to_string(),
                id: id.to_hex(),
            });
        }
        let info = BlobInfo {
            id,
            filename: filename.to_string(),
            length: data.len() as u64,
            upload_date: Utc::now(),
        };
        blobs.insert((bucket, id), BlobObject { info, data });
        Ok(())
    }

    async fn get_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
    ) -> Result<Option<BlobObject>, StoreError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(&(bucket, id)).cloned())
    }

    async fn delete_blob(&self, bucket: Bucket, id: ObjectId) -> Result<bool, StoreError> {
        let mut blobs = self.blobs.write().await;
        Ok(blobs.remove(&(bucket, id)).is_some())
    }
}

/// Sled (embedded database) backend
///
/// One tree per collection keyed by `_id`, plus `<bucket>.files` (metadata)
/// and `<bucket>.chunks` (content) per blob bucket. Container identifiers are
/// indexed so the per-report existence check does not scan.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open sled DB: {}", e)))?;
        let backend = Self { db };
        backend.ensure_trees()?;
        Ok(backend)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(|e| {
            StoreError::Backend(format!("Failed to create in-memory sled DB: {}", e))
        })?;
        let backend = Self { db };
        backend.ensure_trees()?;
        Ok(backend)
    }

    fn ensure_trees(&self) -> Result<(), StoreError> {
        for c in Collection::ALL {
            self.collection_tree(c)?;
        }
        for b in Bucket::ALL {
            self.files_tree(b)?;
            self.chunks_tree(b)?;
        }
        self.tree(TREE_IDX_IDENTIFIER)?;
        Ok(())
    }

    fn tree(&self, name: &str) -> Result<sled::Tree, StoreError> {
        self.db.open_tree(name).map_err(backend_err)
    }

    fn collection_tree(&self, collection: Collection) -> Result<sled::Tree, StoreError> {
        self.tree(collection.name())
    }

    fn files_tree(&self, bucket: Bucket) -> Result<sled::Tree, StoreError> {
        self.tree(&format!("{}.files", bucket.name()))
    }

    fn chunks_tree(&self, bucket: Bucket) -> Result<sled::Tree, StoreError> {
        self.tree(&format!("{}.chunks", bucket.name()))
    }

    fn decode(raw: &[u8]) -> Result<Document, StoreError> {
        serde_json::from_slice(raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn index_identifier(&self, id: &str, doc: &Document) -> Result<(), StoreError> {
        if let Some(identifier) = doc.get("Identifier").and_then(|v| v.as_str()) {
            self.tree(TREE_IDX_IDENTIFIER)?
                .insert(identifier.as_bytes(), id.as_bytes())
                .map_err(backend_err)?;
        }
        Ok(())
    }

    fn find_by_identifier(&self, identifier: &str) -> Result<Option<Document>, StoreError> {
        let Some(id) = self
            .tree(TREE_IDX_IDENTIFIER)?
            .get(identifier.as_bytes())
            .map_err(backend_err)?
        else {
            return Ok(None);
        };
        match self
            .collection_tree(Collection::Containers)?
            .get(&id)
            .map_err(backend_err)?
        {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn scan(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(sled::IVec, Document)>, StoreError> {
        let mut hits = Vec::new();
        for kv in self.collection_tree(collection)?.iter() {
            let (key, raw) = kv.map_err(backend_err)?;
            let doc = Self::decode(&raw)?;
            if doc.get(field) == Some(value) {
                hits.push((key, doc));
            }
        }
        Ok(hits)
    }
}

fn backend_err(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl StoreBackend for SledBackend {
    async fn insert_one(
        &self,
        collection: Collection,
        document: Document,
    ) -> Result<(), StoreError> {
        let id = document_id(&document)?;
        let serialized = serde_json::to_vec(&document)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let swapped = self
            .collection_tree(collection)?
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(serialized))
            .map_err(backend_err)?;
        if swapped.is_err() {
            return Err(StoreError::Duplicate {
                collection: collection.name().to_string(),
                id,
            });
        }

        if collection == Collection::Containers {
            self.index_identifier(&id, &document)?;
        }
        Ok(())
    }

    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        let tree = self.collection_tree(collection)?;
        let mut batch = sled::Batch::default();
        let mut seen = HashSet::with_capacity(documents.len());

        for doc in &documents {
            let id = document_id(doc)?;
            let exists = tree.contains_key(id.as_bytes()).map_err(backend_err)?;
            if exists || !seen.insert(id.clone()) {
                return Err(StoreError::Duplicate {
                    collection: collection.name().to_string(),
                    id,
                });
            }
            let serialized =
                serde_json::to_vec(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.insert(id.as_bytes(), serialized);
        }

        tree.apply_batch(batch).map_err(backend_err)?;

        if collection == Collection::Containers {
            for doc in &documents {
                self.index_identifier(&document_id(doc)?, doc)?;
            }
        }
        Ok(())
    }

    async fn find_one(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>, StoreError> {
        if collection == Collection::Containers && field == "Identifier" {
            // Every stored container is indexed; a miss means no such report.
            return match value.as_str() {
                Some(identifier) => self.find_by_identifier(identifier),
                None => Ok(None),
            };
        }
        Ok(self
            .scan(collection, field, value)?
            .into_iter()
            .next()
            .map(|(_, doc)| doc))
    }

    async fn delete_many(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<usize, StoreError> {
        let tree = self.collection_tree(collection)?;
        let hits = self.scan(collection, field, value)?;
        let idx = self.tree(TREE_IDX_IDENTIFIER)?;

        for (key, doc) in &hits {
            tree.remove(key).map_err(backend_err)?;
            if collection != Collection::Containers {
                continue;
            }
            if let Some(identifier) = doc.get("Identifier").and_then(|v| v.as_str()) {
                // Only drop the index entry if it still points at this document.
                let _ = idx
                    .compare_and_swap(
                        identifier.as_bytes(),
                        Some(&key[..]),
                        None as Option<&[u8]>,
                    )
                    .map_err(backend_err)?;
            }
        }
        Ok(hits.len())
    }

    async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        Ok(self.collection_tree(collection)?.len())
    }

    async fn put_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let files = self.files_tree(bucket)?;
        let key = id.bytes();
        if files.contains_key(key).map_err(backend_err)? {
            return Err(StoreError::Duplicate {
                collection: bucket.name().to_string(),
                id: id.to_hex(),
            });
        }

        let info = BlobInfo {
            id,
            filename: filename.to_string(),
            length: data.len() as u64,
            upload_date: Utc::now(),
        };
        let meta =
            serde_json::to_vec(&info).map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Content first so a visible metadata entry always has its chunks.
        self.chunks_tree(bucket)?
            .insert(key, data)
            .map_err(backend_err)?;
        files.insert(key, meta).map_err(backend_err)?;
        Ok(())
    }

    async fn get_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
    ) -> Result<Option<BlobObject>, StoreError> {
        let key = id.bytes();
        let Some(meta) = self.files_tree(bucket)?.get(key).map_err(backend_err)? else {
            return Ok(None);
        };
        let info: BlobInfo =
            serde_json::from_slice(&meta).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let data = self
            .chunks_tree(bucket)?
            .get(key)
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound(format!("{} chunks for {}", bucket, id)))?;
        Ok(Some(BlobObject {
            info,
            data: data.to_vec(),
        }))
    }

    async fn delete_blob(&self, bucket: Bucket, id: ObjectId) -> Result<bool, StoreError> {
        let key = id.bytes();
        let existed = self
            .files_tree(bucket)?
            .remove(key)
            .map_err(backend_err)?
            .is_some();
        self.chunks_tree(bucket)?.remove(key).map_err(backend_err)?;
        Ok(existed)
    }
}
