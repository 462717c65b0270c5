#![allow(dead_code)]

use async_trait::async_trait;
use ra_ingest::IngestConfig;
use ra_store::{
    BlobObject, Bucket, Collection, Document, InMemoryBackend, StoreBackend, StoreError,
};
use ra_types::ObjectId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Write operations seen by `RecordingBackend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Write {
    InsertOne(Collection),
    InsertMany(Collection),
    PutBlob(Bucket),
}

/// In-memory backend that counts writes and notices when writes of two
/// different reports are in flight at the same time.
pub struct RecordingBackend {
    inner: InMemoryBackend,
    delay: Duration,
    failing: Option<Collection>,
    writes: Mutex<HashMap<Write, usize>>,
    documents: Mutex<HashMap<Collection, usize>>,
    owners: Mutex<HashMap<String, String>>,
    active: Mutex<HashMap<String, usize>>,
    overlapped: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Every write sleeps for `delay` while marked active.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            delay,
            failing: None,
            writes: Mutex::new(HashMap::new()),
            documents: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            overlapped: AtomicBool::new(false),
        }
    }

    /// Batch inserts into `collection` fail without storing anything.
    pub fn failing_inserts(collection: Collection) -> Self {
        Self {
            failing: Some(collection),
            ..Self::new()
        }
    }

    pub fn writes(&self, kind: Write) -> usize {
        self.writes.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.writes.lock().unwrap().values().sum()
    }

    /// Documents written to `collection` through this wrapper
    pub fn documents_written(&self, collection: Collection) -> usize {
        self.documents
            .lock()
            .unwrap()
            .get(&collection)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.writes.lock().unwrap().clear();
        self.documents.lock().unwrap().clear();
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn owner_of(&self, doc: &Document) -> String {
        if let (Some(id), Some(identifier)) = (
            doc.get("_id").and_then(Value::as_str),
            doc.get("Identifier").and_then(Value::as_str),
        ) {
            self.owners
                .lock()
                .unwrap()
                .insert(id.to_string(), identifier.to_string());
            return identifier.to_string();
        }
        let container = doc
            .get("ContainerId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.owners
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .unwrap_or_else(|| container.to_string())
    }

    async fn track<T>(
        &self,
        kind: Write,
        owner: String,
        docs: usize,
        op: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        *self.writes.lock().unwrap().entry(kind).or_default() += 1;
        if let Write::InsertOne(c) | Write::InsertMany(c) = kind {
            *self.documents.lock().unwrap().entry(c).or_default() += docs;
        }
        {
            let mut active = self.active.lock().unwrap();
            if active.iter().any(|(other, n)| *other != owner && *n > 0) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            *active.entry(owner.clone()).or_default() += 1;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = op.await;
        if let Some(n) = self.active.lock().unwrap().get_mut(&owner) {
            *n -= 1;
        }
        result
    }
}

#[async_trait]
impl StoreBackend for RecordingBackend {
    async fn insert_one(&self, collection: Collection, document: Document) -> Result<(), StoreError> {
        let owner = self.owner_of(&document);
        self.track(
            Write::InsertOne(collection),
            owner,
            1,
            self.inner.insert_one(collection, document),
        )
        .await
    }

    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        let owner = documents
            .first()
            .map(|d| self.owner_of(d))
            .unwrap_or_default();
        let n = documents.len();
        if self.failing == Some(collection) {
            *self.writes.lock().unwrap().entry(Write::InsertMany(collection)).or_default() += 1;
            return Err(StoreError::Backend(format!("{} unavailable", collection.name())));
        }
        self.track(
            Write::InsertMany(collection),
            owner,
            n,
            self.inner.insert_many(collection, documents),
        )
        .await
    }

    async fn find_one(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Option<Document>, StoreError> {
        self.inner.find_one(collection, field, value).await
    }

    async fn delete_many(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<usize, StoreError> {
        self.inner.delete_many(collection, field, value).await
    }

    async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        self.inner.count(collection).await
    }

    async fn put_blob(
        &self,
        bucket: Bucket,
        id: ObjectId,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.track(
            Write::PutBlob(bucket),
            filename.to_string(),
            0,
            self.inner.put_blob(bucket, id, filename, data),
        )
        .await
    }

    async fn get_blob(&self, bucket: Bucket, id: ObjectId) -> Result<Option<BlobObject>, StoreError> {
        self.inner.get_blob(bucket, id).await
    }

    async fn delete_blob(&self, bucket: Bucket, id: ObjectId) -> Result<bool, StoreError> {
        self.inner.delete_blob(bucket, id).await
    }
}

pub fn config(root: &Path, concurrency: usize) -> IngestConfig {
    IngestConfig {
        database_url: "memory:".to_string(),
        base_path: root.to_path_buf(),
        concurrency,
        ..IngestConfig::default()
    }
}

/// Lay out a bundle directory. Returns the directory.
pub fn write_bundle(root: &Path, dir: &str, manifest: &Value, sidecars: bool) -> PathBuf {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("summary.json"), manifest.to_string()).unwrap();
    if sidecars {
        std::fs::write(dir.join("keyfile.log"), b"CLIENT_RANDOM 0102 0304\n").unwrap();
        std::fs::write(dir.join("dump.pcap"), [0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00]).unwrap();
    }
    dir
}

pub fn write_fragment(dir: &Path, sub: &str, fragment: &str) {
    let dir = dir.join(sub);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("_containerResult.json"), fragment).unwrap();
}

pub fn manifest(identifier: &str) -> Value {
    json!({
        "Identifier": identifier,
        "Date": 1700000000000i64,
        "ElapsedTime": 5000,
        "FailedTests": 0,
        "SucceededTests": 1,
        "DisabledTests": 0,
        "Score": {},
    })
}

pub fn result(class: &str, method: &str, uuids: &[&str]) -> Value {
    let states: Vec<Value> = uuids
        .iter()
        .map(|u| json!({"uuid": u, "Result": "SUCCEEDED", "SrcPort": 40000, "DstPort": 443}))
        .collect();
    json!({
        "TestMethod": {"ClassName": class, "MethodName": method},
        "Result": "SUCCEEDED",
        "States": states,
    })
}
