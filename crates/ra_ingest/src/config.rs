//! Uploader configuration.
//!
//! Values come from `RA_*` environment variables; the CLI overrides them
//! with flags. None of these change pipeline behaviour, they only feed it.

use crate::error::IngestError;
use std::path::PathBuf;

pub const DEFAULT_DATABASE_URL: &str = "./data/reports";
pub const DEFAULT_KEYLOG_FILE: &str = "keyfile.log";
pub const DEFAULT_PCAP_FILE: &str = "dump.pcap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// `memory:`, `sled://<dir>` or a bare sled directory
    pub database_url: String,
    /// Root of the report tree to scan
    pub base_path: PathBuf,
    /// Number of bundles preprocessed/uploaded at once
    pub concurrency: usize,
    /// Appended to every manifest identifier
    pub identifier_suffix: String,
    pub keylog_file_name: String,
    pub pcap_file_name: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            base_path: PathBuf::from("."),
            concurrency: default_concurrency(),
            identifier_suffix: String::new(),
            keylog_file_name: DEFAULT_KEYLOG_FILE.to_string(),
            pcap_file_name: DEFAULT_PCAP_FILE.to_string(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("RA_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(path) = lookup("RA_BASE_PATH") {
            config.base_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("RA_PREPROCESSING_THREADS") {
            config.concurrency = raw.trim().parse::<usize>().map_err(|_| {
                IngestError::Config(format!("RA_PREPROCESSING_THREADS is not a number: {raw}"))
            })?;
        }
        if let Some(suffix) = lookup("RA_SUFFIX") {
            config.identifier_suffix = suffix;
        }
        if let Some(name) = lookup("RA_KEYLOG_FILE") {
            config.keylog_file_name = name;
        }
        if let Some(name) = lookup("RA_PCAP_FILE") {
            config.pcap_file_name = name;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.concurrency == 0 {
            return Err(IngestError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.database_url.trim().is_empty() {
            return Err(IngestError::Config("database url is empty".to_string()));
        }
        for (what, name) in [
            ("keylog file name", &self.keylog_file_name),
            ("pcap file name", &self.pcap_file_name),
        ] {
            if name.is_empty() || name.contains('/') {
                return Err(IngestError::Config(format!("invalid {what}: '{name}'")));
            }
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
