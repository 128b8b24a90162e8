use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use musync_transfer::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use musync_transfer::config::TransferConfig;
use musync_transfer::fixture::{FixtureSource, FixtureTarget};
use musync_transfer::models::{CheckpointStatus, TrackDescriptor};
use musync_transfer::pipeline::{CollectionSelection, TransferPipeline};
use musync_transfer::progress::format_duration;
use musync_transfer::report::{TrackStatus, TransferReport};
use musync_transfer::safety::{validate_output_path, validate_report_dir};
use musync_transfer::snapshot::fingerprint;

#[derive(Parser, Debug)]
#[command(name = "musync-transfer")]
#[command(
    about = "Transfer music library collections between catalogs with resumable batched writes"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a transfer job between JSON fixture catalogs
    Replay(ReplayArgs),

    /// Print the snapshot fingerprint of a JSON track list
    Fingerprint {
        /// JSON array of tracks
        tracks: PathBuf,
    },

    /// List the stored checkpoints of a job
    Checkpoints {
        /// Checkpoint database
        #[arg(long)]
        db: PathBuf,

        job_id: String,
    },
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Source fixture (collections with tracks)
    #[arg(long)]
    source: PathBuf,

    /// Target fixture (catalog and existing collections)
    #[arg(long)]
    target: PathBuf,

    /// Checkpoint database
    #[arg(long, default_value = "checkpoints.sqlite3")]
    db: PathBuf,

    /// TOML config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Collection id or exact name to transfer (repeatable; default: all)
    #[arg(long = "collection")]
    collections: Vec<String>,

    /// Transfer liked tracks only
    #[arg(long, conflicts_with = "collections")]
    liked_only: bool,

    #[arg(long)]
    dry_run: bool,

    /// Force dry-run regardless of other settings
    #[arg(long)]
    rollback: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Matching worker threads
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    user_id: Option<String>,

    /// Target collection for ambiguous tracks' best candidates
    #[arg(long)]
    review_collection: Option<String>,

    /// Target collection name for liked tracks
    #[arg(long)]
    liked_name: Option<String>,

    /// Directory the JSON report is written to
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Write the resulting target collections to this JSON file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Log progress instead of drawing progress bars
    #[arg(long)]
    log_only: bool,
}

impl ReplayArgs {
    fn load_config(&self) -> Result<TransferConfig> {
        let mut config = match &self.config {
            Some(path) => TransferConfig::from_toml_file(path)?,
            None => TransferConfig::default(),
        };
        config.dry_run |= self.dry_run;
        config.rollback |= self.rollback;
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(workers) = self.workers {
            config.match_workers = workers;
        }
        if let Some(user) = &self.user_id {
            config.user_id = user.clone();
        }
        if let Some(name) = &self.review_collection {
            config.manual_review_collection = Some(name.clone());
        }
        if let Some(name) = &self.liked_name {
            config.liked_collection_name = Some(name.clone());
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = Some(dir.clone());
        }
        if self.log_only {
            config.show_progress = false;
        }
        Ok(config)
    }

    fn selection(&self) -> CollectionSelection {
        if self.liked_only {
            CollectionSelection::LikedOnly
        } else if self.collections.is_empty() {
            CollectionSelection::All
        } else {
            CollectionSelection::Named(self.collections.clone())
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "musync_transfer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Replay(args) => cmd_replay(args),
        Command::Fingerprint { tracks } => cmd_fingerprint(&tracks),
        Command::Checkpoints { db, job_id } => cmd_checkpoints(&db, &job_id),
    }
}

fn cmd_replay(args: ReplayArgs) -> Result<()> {
    let start = Instant::now();
    let mut config = args.load_config()?;

    let inputs: Vec<&Path> = [args.source.as_path(), args.target.as_path(), args.db.as_path()]
        .into_iter()
        .chain(args.config.as_deref())
        .collect();
    if let Some(dump) = &args.dump {
        validate_output_path(dump, "json", &inputs)?;
    }
    if let Some(dir) = &config.report_dir {
        config.report_dir = Some(validate_report_dir(dir, &inputs)?);
    }

    let source = Arc::new(FixtureSource::from_file(&args.source)?);
    let target = Arc::new(FixtureTarget::from_file(&args.target)?);
    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&args.db)?);
    info!(db = %args.db.display(), dry_run = config.effective_dry_run(), "replay configured");

    let pipeline = TransferPipeline::new(source, target.clone(), target.clone(), store, config)?;
    let outcome = pipeline.run(&args.selection());

    if let Some(dump) = &args.dump {
        target.dump_collections(dump)?;
        info!(path = %dump.display(), "target collections dumped");
    }

    match outcome {
        Ok(report) => {
            print_summary(&report, start);
            Ok(())
        }
        Err(aborted) => {
            print_summary(&aborted.report, start);
            if pipeline.config().report_dir.is_none() {
                warn!("no report dir configured; the aborted job's report was not saved");
            }
            Err(aborted.into())
        }
    }
}

fn print_summary(report: &TransferReport, start: Instant) {
    println!("\n{:=<60}", "");
    println!(
        "Job {} {:?}{}",
        report.header.job_id,
        report.header.status,
        if report.header.dry_run { " (dry run)" } else { "" }
    );
    for c in &report.per_collection {
        println!(
            "  {:<30} tracks {:>5}  matched {:>5}  added {:>5}  dup {:>4}  \
             not found {:>4}  ambiguous {:>4}  errors {:>4}",
            c.name, c.tracks, c.matched, c.added, c.duplicates, c.not_found, c.ambiguous, c.errors
        );
    }
    println!("  Match rate: {:.1}%", report.metrics.match_rate * 100.0);
    println!("  Write success rate: {:.1}%", report.metrics.write_success_rate * 100.0);
    println!(
        "  Retries: {} (rate-limit wait {}ms)",
        report.metrics.retry_count, report.metrics.rl_wait_ms
    );
    let failed_batches = report
        .per_batch
        .iter()
        .filter(|b| b.status == CheckpointStatus::Failed)
        .count();
    if !report.per_batch.is_empty() {
        println!(
            "  Batches submitted: {} ({} failed)",
            report.per_batch.len(),
            failed_batches
        );
    }
    let pending = report.count_status(TrackStatus::Pending);
    if pending > 0 {
        println!("  Pending (not attempted): {}", pending);
    }
    if let Some(stop) = &report.header.stopped_at {
        println!(
            "  Stopped at: collection {} batch {}",
            stop.collection_id,
            stop.batch_index.map_or("-".to_string(), |i| i.to_string())
        );
    }
    println!("  Elapsed: {}", format_duration(start.elapsed()));
    println!("{:=<60}", "");
}

fn cmd_fingerprint(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let tracks: Vec<TrackDescriptor> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    println!("{}  ({} tracks)", fingerprint(&tracks), tracks.len());
    Ok(())
}

fn cmd_checkpoints(db: &Path, job_id: &str) -> Result<()> {
    if !db.exists() {
        anyhow::bail!("checkpoint database {} does not exist", db.display());
    }
    let store = SqliteCheckpointStore::open(db)?;
    let checkpoints = store.load_all(job_id)?;
    if checkpoints.is_empty() {
        println!("No checkpoints for job {}", job_id);
        return Ok(());
    }
    println!(
        "{:<24} {:>6}  {:<8} {:>8} {:>8} {:>6}  updated",
        "collection", "batch", "status", "written", "rejected", "tries"
    );
    for cp in &checkpoints {
        println!(
            "{:<24} {:>6}  {:<8} {:>8} {:>8} {:>6}  {}",
            cp.collection_id,
            cp.batch_index,
            cp.status.as_db(),
            cp.written_target_ids.len(),
            cp.rejected.len(),
            cp.attempts,
            cp.updated_at.to_rfc3339()
        );
    }
    Ok(())
}
