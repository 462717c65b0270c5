//! Report ingest - batch import of TLS test reports
//!
//! Bundles found on disk go through the same cycle: parse the manifest,
//! check the store for an earlier import, flatten the result tree into
//! Container / Result / State records, then hand the records to the single
//! upload sequencer which writes one bundle at a time.
//!
//! Preprocessing is bounded by a pool of slot tokens; writes are serialized.

pub mod config;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod sequencer;
pub mod slots;
pub mod transformer;

pub use config::IngestConfig;
pub use discovery::{discover, Bundle};
pub use error::IngestError;
pub use manifest::{RawManifest, RawResult, RawState, ResultNode, Score, ScoreMap, TestMethod};
pub use models::{short_identifier, Container, State, TestResult};
pub use pipeline::{BundleOutcome, RunSummary, Uploader};
pub use progress::{PhaseGauge, Progress};
pub use sequencer::{Sequencer, SequencerHandle, UploadJob, WriteReport};
pub use slots::{SlotPool, SlotToken};
pub use transformer::{
    process_result, transform_bundle, FragmentFailure, ProcessedResult, Transformed, PARSER_ERROR,
};
