//! Dispatcher: runs every bundle through parse → check → transform → upload
//! while holding a slot token.

use crate::config::IngestConfig;
use crate::discovery::Bundle;
use crate::error::IngestError;
use crate::manifest::RawManifest;
use crate::progress::{PhaseGauge, Progress};
use crate::sequencer::{Sequencer, SequencerHandle, UploadJob, WriteReport};
use crate::slots::{SlotPool, SlotToken};
use crate::transformer::transform_bundle;
use ra_store::ReportStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// How one bundle ended.
#[derive(Debug)]
pub enum BundleOutcome {
    Uploaded {
        report: WriteReport,
        fragment_failures: usize,
    },
    /// A container with the same identifier was already stored
    Skipped { identifier: String },
    MissingSidecar { path: PathBuf },
    Failed { path: PathBuf, error: String },
}

/// Totals of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub uploaded: usize,
    /// Uploaded with at least one store error
    pub partial: usize,
    pub skipped: usize,
    pub missing_sidecar: usize,
    pub failed: usize,
    pub fragment_failures: usize,
    /// Most bundles seen between manifest read and upload completion at once
    pub peak_concurrency: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &BundleOutcome) {
        match outcome {
            BundleOutcome::Uploaded {
                report,
                fragment_failures,
            } => {
                self.uploaded += 1;
                if !report.is_complete() {
                    self.partial += 1;
                }
                self.fragment_failures += fragment_failures;
            }
            BundleOutcome::Skipped { .. } => self.skipped += 1,
            BundleOutcome::MissingSidecar { .. } => self.missing_sidecar += 1,
            BundleOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// State shared by every bundle task of one run.
#[derive(Clone)]
struct BundleContext {
    store: ReportStore,
    sequencer: SequencerHandle,
    progress: Arc<Progress>,
    phase: Arc<PhaseGauge>,
    suffix: Arc<str>,
}

pub struct Uploader {
    store: ReportStore,
    config: IngestConfig,
}

impl Uploader {
    pub fn new(store: ReportStore, config: IngestConfig) -> Self {
        Self { store, config }
    }

    /// Process every bundle and wait for all of them.
    ///
    /// Per-bundle problems end up in the summary; only a broken pool or a
    /// crashed sequencer fail the run.
    pub async fn run(&self, bundles: Vec<Bundle>) -> Result<RunSummary, IngestError> {
        self.config.validate()?;
        let pool = SlotPool::new(self.config.concurrency)?;
        let progress = Arc::new(Progress::new(bundles.len()));
        let (sequencer, writer) = Sequencer::spawn(self.store.clone(), Arc::clone(&progress));
        let phase = Arc::new(PhaseGauge::default());

        let ctx = BundleContext {
            store: self.store.clone(),
            sequencer,
            progress: Arc::clone(&progress),
            phase: Arc::clone(&phase),
            suffix: Arc::from(self.config.identifier_suffix.as_str()),
        };

        tracing::info!(
            bundles = bundles.len(),
            concurrency = pool.size(),
            "starting import"
        );

        let mut summary = RunSummary {
            total: bundles.len(),
            ..RunSummary::default()
        };
        let mut tasks: JoinSet<BundleOutcome> = JoinSet::new();

        for bundle in bundles {
            let token = pool.acquire().await?;
            tracing::debug!(slot = token.id(), "using preprocessing slot");

            let span = tracing::info_span!(
                "bundle",
                slot = token.id(),
                manifest = %bundle.manifest_path.display(),
                identifier = tracing::field::Empty,
            );
            let ctx = ctx.clone();
            tasks.spawn(process_bundle(ctx, bundle, token).instrument(span));

            while let Some(joined) = tasks.try_join_next() {
                collect(&mut summary, &progress, joined);
            }
        }
        drop(ctx);

        while let Some(joined) = tasks.join_next().await {
            collect(&mut summary, &progress, joined);
        }

        let written = writer
            .await
            .map_err(|e| IngestError::Task(format!("upload sequencer: {e}")))?;
        summary.peak_concurrency = phase.peak();

        tracing::info!(
            total = summary.total,
            written,
            skipped = summary.skipped,
            missing_sidecar = summary.missing_sidecar,
            failed = summary.failed,
            "import finished"
        );
        Ok(summary)
    }
}

fn collect(
    summary: &mut RunSummary,
    progress: &Progress,
    joined: Result<BundleOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => summary.record(&outcome),
        Err(e) => {
            summary.failed += 1;
            progress.finish();
            tracing::error!(error = %e, "bundle task failed");
        }
    }
}

/// One bundle cycle. The slot token is released when this returns.
async fn process_bundle(ctx: BundleContext, bundle: Bundle, token: SlotToken) -> BundleOutcome {
    let outcome = {
        let _in_phase = ctx.phase.enter();
        run_cycle(&ctx, bundle).await
    };
    tracing::trace!(slot = token.id(), "releasing slot");
    drop(token);
    outcome
}

async fn run_cycle(ctx: &BundleContext, bundle: Bundle) -> BundleOutcome {
    let total = ctx.progress.total();

    let mut manifest = match read_manifest(&bundle.manifest_path).await {
        Ok(manifest) => manifest,
        Err(error) => {
            let finished = ctx.progress.finish();
            tracing::error!(%error, "{:03}/{:03} Error while preprocessing", finished, total);
            return BundleOutcome::Failed {
                path: bundle.manifest_path,
                error: error.to_string(),
            };
        }
    };
    manifest.identifier.push_str(&ctx.suffix);
    let identifier = manifest.identifier.clone();
    tracing::Span::current().record("identifier", identifier.as_str());

    for (what, path) in [("Keylogfile", &bundle.keylog_path), ("Pcap file", &bundle.pcap_path)] {
        if tokio::fs::metadata(path).await.is_err() {
            let finished = ctx.progress.finish();
            tracing::error!(
                path = %path.display(),
                "{:03}/{:03} {} does not exist",
                finished,
                total,
                what
            );
            return BundleOutcome::MissingSidecar { path: path.clone() };
        }
    }

    let exists = match ctx.store.report_exists(&identifier).await {
        Ok(exists) => exists,
        Err(error) => {
            tracing::warn!(%error, "existence check failed, importing anyway");
            false
        }
    };
    if exists {
        let finished = ctx.progress.finish();
        tracing::info!("{:03}/{:03} Skipped (exists already)", finished, total);
        return BundleOutcome::Skipped { identifier };
    }

    tracing::debug!(fragments = bundle.fragment_paths.len(), "start preprocessing");
    let transformed = transform_bundle(manifest, identifier, &bundle.fragment_paths).await;
    let fragment_failures = transformed.failures.len();
    tracing::debug!(
        results = transformed.results.len(),
        states = transformed.states.len(),
        fragment_failures,
        "finished preprocessing"
    );

    let job = UploadJob {
        transformed,
        keylog_path: bundle.keylog_path,
        pcap_path: bundle.pcap_path,
    };
    match ctx.sequencer.submit(job).await {
        Ok(report) => BundleOutcome::Uploaded {
            report,
            fragment_failures,
        },
        Err(error) => {
            let finished = ctx.progress.finish();
            tracing::error!(%error, "{:03}/{:03} Upload not performed", finished, total);
            BundleOutcome::Failed {
                path: bundle.manifest_path,
                error: error.to_string(),
            }
        }
    }
}

async fn read_manifest(path: &Path) -> Result<RawManifest, IngestError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| IngestError::io(path, e))?;
    RawManifest::from_slice(&bytes, path)
}
