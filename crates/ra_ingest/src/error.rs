use ra_store::StoreError;
use std::path::PathBuf;

/// Errors raised while importing a bundle
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot enumerate {path}: {reason}")]
    Discovery { path: PathBuf, reason: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("slot pool closed")]
    SlotPoolClosed,
    #[error("upload sequencer stopped before the bundle was written")]
    SequencerClosed,
    #[error("task failed: {0}")]
    Task(String),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }
}
