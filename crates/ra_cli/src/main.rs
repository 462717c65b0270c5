//! ra-upload - batch importer for TLS test report bundles

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ra_ingest::{discover, IngestConfig, RunSummary, Uploader};
use ra_store::{open_backend, ReportStore, StoreError};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Import report bundles into the report store. Flags override the
/// RA_* environment variables.
#[derive(Parser)]
#[command(name = "ra-upload", version, about)]
struct Cli {
    /// Store location: `memory:`, `sled://<dir>` or a directory
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Root of the report tree
    #[arg(short, long, global = true)]
    base_path: Option<PathBuf>,

    /// Bundles preprocessed at the same time
    #[arg(short = 'j', long, global = true)]
    threads: Option<usize>,

    /// Appended to every report identifier
    #[arg(long, global = true)]
    suffix: Option<String>,

    #[arg(long, global = true)]
    keylog_file: Option<String>,

    #[arg(long, global = true)]
    pcap_file: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Import every bundle under the base path (default)
    Import,

    /// Print a stored container document
    Show { identifier: String },

    /// Delete a report with its results, states and blobs
    Remove { identifier: String },

    /// Concatenate the key logs of one or more reports
    Keylog {
        #[arg(required = true)]
        identifiers: Vec<String>,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    fn config(&self) -> Result<IngestConfig> {
        let mut config = IngestConfig::from_env()?;
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(path) = &self.base_path {
            config.base_path = path.clone();
        }
        if let Some(threads) = self.threads {
            config.concurrency = threads;
        }
        if let Some(suffix) = &self.suffix {
            config.identifier_suffix = suffix.clone();
        }
        if let Some(name) = &self.keylog_file {
            config.keylog_file_name = name.clone();
        }
        if let Some(name) = &self.pcap_file {
            config.pcap_file_name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;

    let backend = open_backend(&config.database_url)
        .with_context(|| format!("opening store at {}", config.database_url))?;
    let store = ReportStore::new(backend);

    match cli.command.unwrap_or(Command::Import) {
        Command::Import => cmd_import(store, config).await,
        Command::Show { identifier } => cmd_show(&store, &identifier).await,
        Command::Remove { identifier } => cmd_remove(&store, &identifier).await,
        Command::Keylog {
            identifiers,
            output,
        } => cmd_keylog(&store, &identifiers, output).await,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_import(store: ReportStore, config: IngestConfig) -> Result<()> {
    let root = std::path::absolute(&config.base_path)
        .with_context(|| format!("resolving {}", config.base_path.display()))?;
    let bundles = discover(&root, &config.keylog_file_name, &config.pcap_file_name)?;
    if bundles.is_empty() {
        tracing::warn!(path = %root.display(), "no reports found");
        return Ok(());
    }

    let summary = Uploader::new(store, config).run(bundles).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Import complete");
    println!("  Reports:          {}", summary.total);
    println!("  Uploaded:         {}", summary.uploaded);
    if summary.partial > 0 {
        println!("  With errors:      {}", summary.partial);
    }
    println!("  Skipped:          {}", summary.skipped);
    println!("  Missing sidecar:  {}", summary.missing_sidecar);
    println!("  Failed:           {}", summary.failed);
    println!("  Bad fragments:    {}", summary.fragment_failures);
    println!("  Peak concurrency: {}", summary.peak_concurrency);
}

async fn cmd_show(store: &ReportStore, identifier: &str) -> Result<()> {
    let Some(container) = store.find_container(identifier).await? else {
        bail!("No report with identifier '{identifier}'");
    };
    println!("{}", serde_json::to_string_pretty(&container)?);
    Ok(())
}

async fn cmd_remove(store: &ReportStore, identifier: &str) -> Result<()> {
    let removed = match store.remove_report(identifier).await {
        Ok(removed) => removed,
        Err(StoreError::NotFound(_)) => bail!("No report with identifier '{identifier}'"),
        Err(e) => return Err(e.into()),
    };
    println!(
        "Removed {} ({} results, {} states, {} blobs)",
        removed.container_id, removed.results, removed.states, removed.blobs
    );
    Ok(())
}

async fn cmd_keylog(
    store: &ReportStore,
    identifiers: &[String],
    output: Option<PathBuf>,
) -> Result<()> {
    let keylogs = store.download_keylogs(identifiers).await?;
    match output {
        Some(path) => {
            std::fs::write(&path, &keylogs)
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = keylogs.len(), "key logs written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&keylogs)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
