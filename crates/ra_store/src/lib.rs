//! Report store - document collections plus blob buckets
//!
//! Imported reports land in three document collections (`containers`,
//! `results`, `states`) and two blob buckets (`keylogfile`, `pcap`). The
//! `StoreBackend` trait is the seam between the uploader and the storage
//! engine; `ReportStore` is the facade the uploader talks to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ra_types::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub mod backends;

pub use backends::*;

/// A stored document. Always carries a string `_id`.
pub type Document = serde_json::Map<String, Value>;

/// Logical document collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Containers,
    Results,
    States,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Containers, Self::Results, Self::States];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Containers => "containers",
            Self::Results => "results",
            Self::States => "states",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Blob buckets for the two binary sidecars of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Keylog,
    Pcap,
}

impl Bucket {
    pub const ALL: [Bucket; 2] = [Self::Keylog, Self::Pcap];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Keylog => "keylogfile",
            Self::Pcap => "pcap",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata of a stored blob object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobInfo {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub filename: String,
    pub length: u64,
    #[serde(rename = "uploadDate")]
    pub upload_date: DateTime<Utc>,
}

/// A blob object with its content.
#[derive(Debug, Clone)]
pub struct BlobObject {
    pub info: BlobInfo,
    pub data: Vec<u8>,
}

/// Trait for storage engines
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Insert one document. Fails with `Duplicate` if its `_id` already exists.
    async fn insert_one(&self, collection: Collection, document: Document)
        -> Result<(), StoreError>;

    /// Insert a batch. The batch is rejected as a whole if any `_id` collides.
    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError>;

    /// First document whose top-level `field` equals `value`
    async fn find_one(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>, StoreError>;

    /// Delete every document whose top-level `field` equals `value`
    async fn delete_many(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<usize, StoreError>;

    /// Number of documents in a collection
    async fn count(&self, collection: Collection) -> Result<usize, StoreError>;

    /// Store a blob under a pre-generated id
    async fn put_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError>;

    /// Retrieve a blob by id
    async fn get_blob(&self, bucket: Bucket, id: ObjectId)
        -> Result<Option<BlobObject>, StoreError>;

    /// Delete a blob. Returns whether it existed.
    async fn delete_blob(&self, bucket: Bucket, id: ObjectId) -> Result<bool, StoreError>;
}

/// Open a backend from a database URL.
///
/// `memory:` selects the in-memory backend, `sled://<path>` or a bare path
/// selects a sled database directory.
pub fn open_backend(url: &str) -> Result<Arc<dyn StoreBackend>, StoreError> {
    if url == "memory:" || url == "memory://" {
        return Ok(Arc::new(InMemoryBackend::new()));
    }
    let path = url.strip_prefix("sled://").unwrap_or(url);
    if path.is_empty() {
        return Err(StoreError::Backend("empty database path".to_string()));
    }
    Ok(Arc::new(SledBackend::new(path)?))
}

/// Counts of what `ReportStore::remove_report` deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedReport {
    pub container_id: String,
    pub results: usize,
    pub states: usize,
    pub blobs: usize,
}

/// The main store interface used by the uploader
#[derive(Clone)]
pub struct ReportStore {
    backend: Arc<dyn StoreBackend>,
}

impl ReportStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// Whether a container with this external identifier is already stored
    pub async fn report_exists(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.find_container(identifier).await?.is_some())
    }

    pub async fn find_container(&self, identifier: &str) -> Result<Option<Document>, StoreError> {
        self.backend
            .find_one(
                Collection::Containers,
                "Identifier",
                &Value::String(identifier.to_string()),
            )
            .await
    }

    pub async fn add_container<T: Serialize>(&self, container: &T) -> Result<(), StoreError> {
        let doc = stamped_document(container, Utc::now())?;
        self.backend.insert_one(Collection::Containers, doc).await
    }

    pub async fn add_results<T: Serialize>(&self, results: &[T]) -> Result<(), StoreError> {
        self.insert_batch(Collection::Results, results).await
    }

    pub async fn add_states<T: Serialize>(&self, states: &[T]) -> Result<(), StoreError> {
        self.insert_batch(Collection::States, states).await
    }

    async fn insert_batch<T: Serialize>(
        &self,
        collection: Collection,
        items: &[T],
    ) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let docs = items
            .iter()
            .map(|item| stamped_document(item, now))
            .collect::<Result<Vec<_>, _>>()?;
        self.backend.insert_many(collection, docs).await
    }

    /// Upload a sidecar file. `filename` is the human-readable name
    /// (the report identifier).
    pub async fn upload_file(
        &self,
        bucket: Bucket,
        filename: &str,
        id: ObjectId,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.backend.put_blob(bucket, id, filename, data).await
    }

    pub async fn download_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
    ) -> Result<Option<BlobObject>, StoreError> {
        self.backend.get_blob(bucket, id).await
    }

    /// Concatenate the stored key logs of the given reports, in the given
    /// order. Unknown identifiers and reports without a key log are skipped.
    pub async fn download_keylogs(&self, identifiers: &[String]) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::new();
        for identifier in identifiers {
            let Some(container) = self.find_container(identifier).await? else {
                continue;
            };
            let Some(raw) = container.get("KeylogfileStorageId").and_then(|v| v.as_str()) else {
                continue;
            };
            let id = ObjectId::parse(raw)
                .map_err(|e| StoreError::InvalidDocument(format!("KeylogfileStorageId: {}", e)))?;
            if let Some(blob) = self.backend.get_blob(Bucket::Keylog, id).await? {
                out.extend_from_slice(&blob.data);
            }
        }
        Ok(out)
    }

    /// Delete a report with its results, states and both blobs.
    pub async fn remove_report(&self, identifier: &str) -> Result<RemovedReport, StoreError> {
        let container = self
            .find_container(identifier)
            .await?
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))?;
        let container_id = document_id(&container)?;
        let id_value = Value::String(container_id.clone());

        let results = self
            .backend
            .delete_many(Collection::Results, "ContainerId", &id_value)
            .await?;
        let states = self
            .backend
            .delete_many(Collection::States, "ContainerId", &id_value)
            .await?;

        let mut blobs = 0;
        for (bucket, field) in [
            (Bucket::Keylog, "KeylogfileStorageId"),
            (Bucket::Pcap, "PcapStorageId"),
        ] {
            let Some(raw) = container.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            let id = ObjectId::parse(raw)
                .map_err(|e| StoreError::InvalidDocument(format!("{}: {}", field, e)))?;
            if self.backend.delete_blob(bucket, id).await? {
                blobs += 1;
            }
        }

        self.backend
            .delete_many(Collection::Containers, "_id", &id_value)
            .await?;

        Ok(RemovedReport {
            container_id,
            results,
            states,
            blobs,
        })
    }
}

/// Serialize `item` into a document and stamp `createdAt` / `updatedAt`.
fn stamped_document<T: Serialize>(item: &T, now: DateTime<Utc>) -> Result<Document, StoreError> {
    let value = serde_json::to_value(item).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let Value::Object(mut doc) = value else {
        return Err(StoreError::InvalidDocument(
            "document must serialize to a JSON object".to_string(),
        ));
    };
    document_id(&doc)?;
    let ts = Value::String(now.to_rfc3339());
    doc.insert("createdAt".to_string(), ts.clone());
    doc.insert("updatedAt".to_string(), ts);
    Ok(doc)
}

/// The `_id` of a document
pub fn document_id(doc: &Document) -> Result<String, StoreError> {
    doc.get("_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidDocument("missing string _id".to_string()))
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Duplicate key in {collection}: {id}")]
    Duplicate { collection: String, id: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container_doc(identifier: &str) -> (ObjectId, Value) {
        let id = ObjectId::new();
        (
            id,
            json!({
                "_id": id,
                "Identifier": identifier,
                "KeylogfileStorageId": null,
                "PcapStorageId": null,
            }),
        )
    }

    #[tokio::test]
    async fn report_exists_after_insert() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        assert!(!store.report_exists("run-1").await.unwrap());

        let (_, doc) = container_doc("run-1");
        store.add_container(&doc).await.unwrap();

        assert!(store.report_exists("run-1").await.unwrap());
        assert!(!store.report_exists("run-2").await.unwrap());
    }

    #[tokio::test]
    async fn inserted_documents_carry_timestamps() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        let (_, doc) = container_doc("run-ts");
        store.add_container(&doc).await.unwrap();

        let found = store.find_container("run-ts").await.unwrap().unwrap();
        let created = found["createdAt"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok());
        assert_eq!(found["createdAt"], found["updatedAt"]);
    }

    #[tokio::test]
    async fn document_without_id_is_rejected() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        let err = store
            .add_container(&json!({"Identifier": "no-id"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn empty_batches_are_noops() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        let none: Vec<Value> = vec![];
        store.add_results(&none).await.unwrap();
        assert_eq!(store.backend().count(Collection::Results).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_report_deletes_everything() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        let container_id = ObjectId::new();
        let keylog_id = ObjectId::new();
        let pcap_id = ObjectId::new();

        store
            .add_container(&json!({
                "_id": container_id,
                "Identifier": "run-rm",
                "KeylogfileStorageId": keylog_id,
                "PcapStorageId": pcap_id,
            }))
            .await
            .unwrap();
        store
            .add_results(&[json!({"_id": ObjectId::new(), "ContainerId": container_id})])
            .await
            .unwrap();
        store
            .add_states(&[
                json!({"_id": ObjectId::new(), "ContainerId": container_id}),
                json!({"_id": ObjectId::new(), "ContainerId": container_id}),
            ])
            .await
            .unwrap();
        store
            .upload_file(Bucket::Keylog, "run-rm", keylog_id, b"CLIENT_RANDOM".to_vec())
            .await
            .unwrap();
        store
            .upload_file(Bucket::Pcap, "run-rm", pcap_id, vec![0xd4, 0xc3, 0xb2, 0xa1])
            .await
            .unwrap();

        let removed = store.remove_report("run-rm").await.unwrap();
        assert_eq!(removed.container_id, container_id.to_hex());
        assert_eq!(removed.results, 1);
        assert_eq!(removed.states, 2);
        assert_eq!(removed.blobs, 2);

        assert!(!store.report_exists("run-rm").await.unwrap());
        for c in Collection::ALL {
            assert_eq!(store.backend().count(c).await.unwrap(), 0, "{c}");
        }
        assert!(store
            .download_blob(Bucket::Pcap, pcap_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn keylogs_are_concatenated_in_request_order() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        for (identifier, content) in [("run-a", "A\n"), ("run-b", "B\n")] {
            let keylog_id = ObjectId::new();
            store
                .add_container(&json!({
                    "_id": ObjectId::new(),
                    "Identifier": identifier,
                    "KeylogfileStorageId": keylog_id,
                }))
                .await
                .unwrap();
            store
                .upload_file(Bucket::Keylog, identifier, keylog_id, content.as_bytes().to_vec())
                .await
                .unwrap();
        }

        let ids = vec!["run-b".to_string(), "missing".to_string(), "run-a".to_string()];
        let joined = store.download_keylogs(&ids).await.unwrap();
        assert_eq!(joined, b"B\nA\n");
    }

    #[tokio::test]
    async fn remove_missing_report_is_not_found() {
        let store = ReportStore::new(Arc::new(InMemoryBackend::new()));
        let err = store.remove_report("absent").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn sled_report_exists_after_insert() {
        let store = ReportStore::new(Arc::new(SledBackend::in_memory().expect("sled backend")));
        let (_, doc) = container_doc("run-sled");
        store.add_container(&doc).await.unwrap();
        assert!(store.report_exists("run-sled").await.unwrap());
    }

    #[test]
    fn open_backend_accepts_memory_url() {
        assert!(open_backend("memory:").is_ok());
        assert!(open_backend("sled://").is_err());
    }
}
