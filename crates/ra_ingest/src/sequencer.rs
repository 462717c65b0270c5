//! Serialized upload stage.
//!
//! Any number of slots submit preprocessed bundles; one consumer task writes
//! them to the store strictly one at a time, in arrival order. A submitting
//! slot waits on a oneshot until its own bundle has been written.

use crate::error::IngestError;
use crate::models::{Container, State, TestResult};
use crate::progress::Progress;
use crate::transformer::Transformed;
use ra_store::{Bucket, ReportStore};
use ra_types::ObjectId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A bundle ready to be written.
#[derive(Debug)]
pub struct UploadJob {
    pub transformed: Transformed,
    pub keylog_path: PathBuf,
    pub pcap_path: PathBuf,
}

/// What the sequencer did for one bundle.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub container_id: ObjectId,
    pub identifier: String,
    pub keylog_id: ObjectId,
    pub pcap_id: ObjectId,
    pub results: usize,
    pub states: usize,
    /// Store failures, logged and not retried
    pub errors: Vec<String>,
    pub finished: usize,
    /// Time spent writing this bundle, excluding preprocessing and queueing
    pub elapsed: Duration,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Submission {
    job: UploadJob,
    done: oneshot::Sender<WriteReport>,
}

/// Submission side of the sequencer. Cheap to clone; the sequencer stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct SequencerHandle {
    tx: mpsc::UnboundedSender<Submission>,
}

impl SequencerHandle {
    /// Queue a bundle and wait until it has been written.
    pub async fn submit(&self, job: UploadJob) -> Result<WriteReport, IngestError> {
        let (done, written) = oneshot::channel();
        self.tx
            .send(Submission { job, done })
            .map_err(|_| IngestError::SequencerClosed)?;
        written.await.map_err(|_| IngestError::SequencerClosed)
    }
}

pub struct Sequencer {
    store: ReportStore,
    progress: Arc<Progress>,
    rx: mpsc::UnboundedReceiver<Submission>,
}

impl Sequencer {
    /// Start the consumer task.
    ///
    /// The task ends when `progress` reaches its total or every handle is
    /// gone, and yields the number of bundles it wrote.
    pub fn spawn(store: ReportStore, progress: Arc<Progress>) -> (SequencerHandle, JoinHandle<usize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer {
            store,
            progress,
            rx,
        };
        let task = tokio::spawn(sequencer.run());
        (SequencerHandle { tx }, task)
    }

    async fn run(mut self) -> usize {
        let mut written = 0;
        while !self.progress.is_complete() {
            let Some(Submission { job, done }) = self.rx.recv().await else {
                break;
            };
            let report = write_bundle(&self.store, &self.progress, job).await;
            written += 1;
            if done.send(report).is_err() {
                tracing::warn!("bundle written but its submitter is gone");
            }
        }
        tracing::debug!(written, "upload sequencer stopped");
        written
    }
}

async fn write_bundle(store: &ReportStore, progress: &Progress, job: UploadJob) -> WriteReport {
    let started = Instant::now();
    let UploadJob {
        transformed,
        keylog_path,
        pcap_path,
    } = job;
    let Transformed {
        mut container,
        results,
        states,
        ..
    } = transformed;

    let keylog_id = ObjectId::new();
    let pcap_id = ObjectId::new();
    container.keylog_storage_id = Some(keylog_id);
    container.pcap_storage_id = Some(pcap_id);
    let identifier = container.identifier.clone();

    tracing::trace!(identifier = %identifier, "starting upload");
    let (keylog, pcap, documents) = tokio::join!(
        upload_sidecar(store, Bucket::Keylog, &identifier, keylog_id, &keylog_path),
        upload_sidecar(store, Bucket::Pcap, &identifier, pcap_id, &pcap_path),
        insert_documents(store, &container, &results, &states),
    );

    let mut errors = Vec::new();
    for outcome in [keylog, pcap] {
        if let Err(error) = outcome {
            errors.push(error);
        }
    }
    errors.extend(documents);
    for error in &errors {
        tracing::error!(identifier = %identifier, %error, "store write failed");
    }

    let finished = progress.finish();
    let elapsed = started.elapsed();
    tracing::info!(
        identifier = %identifier,
        "{:03}/{:03} Upload finished ({:?})",
        finished,
        progress.total(),
        elapsed
    );

    WriteReport {
        container_id: container.id,
        identifier,
        keylog_id,
        pcap_id,
        results: results.len(),
        states: states.len(),
        errors,
        finished,
        elapsed,
    }
}

async fn upload_sidecar(
    store: &ReportStore,
    bucket: Bucket,
    identifier: &str,
    id: ObjectId,
    path: &Path,
) -> Result<(), String> {
    // Read whole; only the bundle being written holds its sidecars in memory.
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("{} sidecar: {}", bucket, IngestError::io(path, e)))?;
    tracing::debug!(%bucket, bytes = data.len(), "sidecar loaded");
    store
        .upload_file(bucket, identifier, id, data)
        .await
        .map_err(|e| format!("{} upload: {}", bucket, e))?;
    tracing::trace!(%bucket, "finished uploading");
    Ok(())
}

/// Container first, then the result and state batches. A failed step is
/// recorded and the following ones are still attempted.
async fn insert_documents(
    store: &ReportStore,
    container: &Container,
    results: &[TestResult],
    states: &[State],
) -> Vec<String> {
    let mut errors = Vec::new();
    if let Err(e) = store.add_container(container).await {
        errors.push(format!("container insert: {}", e));
    }
    if let Err(e) = store.add_results(results).await {
        errors.push(format!("results insert: {}", e));
    }
    if let Err(e) = store.add_states(states).await {
        errors.push(format!("states insert: {}", e));
    }
    errors
}
