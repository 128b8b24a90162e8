//! Transfer pipeline: snapshot → match → write → report.
//!
//! Every selected collection is snapshotted before any matching starts, since
//! the job identity depends on all of them. Collections are then processed one
//! at a time; within a collection, matching runs on a bounded worker pool and
//! writing is strictly sequential.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backoff::{Backoff, Clock, SystemClock};
use crate::checkpoint::{CheckpointStore, JobLock};
use crate::config::TransferConfig;
use crate::deadline::call_with_deadline;
use crate::error::{ConfigError, ErrorClass, JobAborted, ProviderError, RetryKind, TransferError};
use crate::matching::MatchingEngine;
use crate::models::{Collection, CollectionKind, JobIdentity, MatchStatus, StopPoint, TransferJob};
use crate::ports::{SourceReader, TargetSearch, TargetWriter};
use crate::progress::format_duration;
use crate::report::{BatchEntry, JobStatus, Reporter, TransferReport};
use crate::snapshot::{job_snapshot_hash, Snapshot, SnapshotBuilder};
use crate::writer::{plan_batches, BatchWriter, CancelToken, WriteTarget};

/// Suffix of the checkpoint key used for a collection's review writes.
pub const REVIEW_KEY_SUFFIX: &str = "#review";

/// Which source collections a job transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionSelection {
    All,
    LikedOnly,
    /// Collections whose id or exact name is listed
    Named(Vec<String>),
}

impl CollectionSelection {
    pub fn select(&self, collections: Vec<Collection>) -> Vec<Collection> {
        match self {
            CollectionSelection::All => collections,
            CollectionSelection::LikedOnly => collections
                .into_iter()
                .filter(|c| c.kind == CollectionKind::Liked)
                .collect(),
            CollectionSelection::Named(wanted) => {
                for name in wanted {
                    if !collections.iter().any(|c| &c.id == name || &c.name == name) {
                        warn!(collection = %name, "requested collection not found in source");
                    }
                }
                collections
                    .into_iter()
                    .filter(|c| wanted.iter().any(|w| w == &c.id || w == &c.name))
                    .collect()
            }
        }
    }
}

pub struct TransferPipeline {
    source: Arc<dyn SourceReader>,
    search: Arc<dyn TargetSearch>,
    target: Arc<dyn TargetWriter>,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    config: TransferConfig,
    cancel: CancelToken,
}

/// Mutable state of one run, finalized into the report.
struct RunState {
    reporter: Reporter,
    stopped_at: Option<StopPoint>,
}

impl TransferPipeline {
    pub fn new(
        source: Arc<dyn SourceReader>,
        search: Arc<dyn TargetSearch>,
        target: Arc<dyn TargetWriter>,
        store: Arc<dyn CheckpointStore>,
        config: TransferConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            source,
            search,
            target,
            store,
            clock: Arc::new(SystemClock::new()),
            config: config.resolved()?,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token that stops the job at the next batch boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Runs one job. The report is finalized whether or not the job completes.
    pub fn run(&self, selection: &CollectionSelection) -> Result<TransferReport, JobAborted> {
        let started_at = Utc::now();
        let start_ms = self.clock.now_ms();
        let mut state = RunState {
            reporter: Reporter::new(
                self.source.provider_id(),
                self.target.provider_id(),
                self.config.dry_run,
                started_at,
            ),
            stopped_at: None,
        };

        let outcome = self.execute(selection, &mut state);

        let duration_ms = self.clock.now_ms().saturating_sub(start_ms);
        let RunState { reporter, stopped_at } = state;
        let (status, stopped_at, message) = match &outcome {
            Ok(()) => (JobStatus::Completed, None, None),
            Err(e) => {
                let status = match e {
                    TransferError::Cancelled => JobStatus::Cancelled,
                    _ => JobStatus::Aborted,
                };
                (status, stopped_at, Some(e.to_string()))
            }
        };
        let report =
            reporter.finalize(status, stopped_at.clone(), message, Utc::now(), duration_ms);
        self.persist_report(&report);

        info!(
            job_id = %report.header.job_id,
            status = ?report.header.status,
            match_rate = report.metrics.match_rate,
            write_success_rate = report.metrics.write_success_rate,
            retries = report.metrics.retry_count,
            "job finished in {}",
            format_duration(Duration::from_millis(duration_ms))
        );

        match outcome {
            Ok(()) => Ok(report),
            Err(error) => {
                error!(error = %error, stopped_at = ?stopped_at, "job stopped");
                Err(JobAborted {
                    error,
                    stopped_at,
                    report: Box::new(report),
                })
            }
        }
    }

    fn persist_report(&self, report: &TransferReport) {
        let Some(dir) = &self.config.report_dir else {
            return;
        };
        match report.write_to_dir(dir) {
            Ok(path) => info!(path = %path.display(), "report written"),
            Err(e) => warn!("failed to write report: {:#}", e),
        }
    }

    fn execute(
        &self,
        selection: &CollectionSelection,
        state: &mut RunState,
    ) -> Result<(), TransferError> {
        let config = &self.config;
        let dry_run = config.dry_run;

        // Snapshot every selected collection first
        let source = Arc::clone(&self.source);
        let collections =
            call_with_deadline(config.operation_deadline(), move || source.list_collections())
                .map_err(|e| source_failure(&e))?;
        let selected = selection.select(collections);
        info!(collections = selected.len(), dry_run, "starting transfer");

        let builder = SnapshotBuilder::new(Arc::clone(&self.source), config.operation_deadline());
        let mut snapshots: Vec<Snapshot> = Vec::with_capacity(selected.len());
        for collection in &selected {
            state.stopped_at = Some(StopPoint {
                collection_id: collection.id.clone(),
                batch_index: None,
            });
            snapshots.push(builder.build(collection).map_err(|e| source_failure(&e))?);
        }

        let identity = JobIdentity {
            user_id: config.user_id.clone(),
            source_provider_id: self.source.provider_id().to_string(),
            target_provider_id: self.target.provider_id().to_string(),
            snapshot_hash: job_snapshot_hash(&snapshots),
        };

        // Dry runs never touch the registry or the lock
        let (job, _lock) = if dry_run {
            (TransferJob::new(identity, true), None)
        } else {
            let job = self.find_or_register(identity)?;
            let lock = JobLock::acquire(
                Arc::clone(&self.store),
                &job.identity.key(),
                Duration::from_secs(config.stale_lock_secs),
            )
            .map_err(|e| TransferError::Store(format!("{:#}", e)))?
            .ok_or_else(|| TransferError::JobLocked(job.identity.key()))?;
            (job, Some(lock))
        };
        state.reporter.set_job(&job.job_id, &job.identity.snapshot_hash);
        info!(
            job_id = %job.job_id,
            snapshot_hash = %job.identity.snapshot_hash,
            "job identity resolved"
        );

        let engine = MatchingEngine::new(Arc::clone(&self.search), Arc::clone(&self.clock), config);
        let mut writer = BatchWriter::new(
            Arc::clone(&self.target),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.cancel.clone(),
            config,
        );
        let mut review_target: Option<String> = None;

        for snapshot in &snapshots {
            let collection = &snapshot.collection;
            state.stopped_at = Some(StopPoint {
                collection_id: collection.id.clone(),
                batch_index: None,
            });
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            state.reporter.begin_collection(collection);

            let matches = engine.match_all(&snapshot.tracks, config.show_progress)?;

            let mut to_write: Vec<BatchEntry> = Vec::new();
            let mut to_review: Vec<BatchEntry> = Vec::new();
            for m in &matches {
                state.reporter.add_retries(m.retries as u64);
                state.reporter.add_rl_wait(m.rl_wait_ms);
                let source_id = &m.result.source_track.source_id;
                let invalid = snapshot.invalid.iter().any(|(id, _)| id == source_id);
                let entry = state.reporter.record_match(&collection.id, &m.result, invalid);
                match (m.result.status, m.result.target_id()) {
                    (MatchStatus::Matched, Some(target_id)) => {
                        to_write.push((entry, target_id.to_string()))
                    }
                    (MatchStatus::Ambiguous, _) => {
                        if let Some(best) = m.result.top_candidates.first() {
                            to_review.push((entry, best.target_id.clone()));
                        }
                    }
                    _ => {}
                }
            }

            let plan = plan_batches(&to_write, writer.batch_size(config.batch_size));
            for entry in &plan.duplicate_entries {
                state.reporter.record_duplicate(*entry);
            }

            if !plan.batches.is_empty() {
                let name = target_collection_name(collection, config);
                let target_collection_id = self.resolve_collection(&name)?;
                state.reporter.set_target_collection(&collection.id, &target_collection_id);

                let dest = WriteTarget {
                    job_id: &job.job_id,
                    checkpoint_collection_id: &collection.id,
                    report_collection_id: &collection.id,
                    target_collection_id: &target_collection_id,
                    dry_run,
                    review: false,
                };
                if let Err(stop) = writer.write_collection(&dest, &plan, &mut state.reporter) {
                    state.stopped_at = Some(StopPoint {
                        collection_id: collection.id.clone(),
                        batch_index: stop.batch_index,
                    });
                    return Err(stop.error);
                }
            }

            let review_name = config.manual_review_collection.as_ref();
            if let (Some(review_name), false) = (review_name, to_review.is_empty()) {
                let review_id = match &review_target {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.resolve_collection(review_name)?;
                        review_target = Some(id.clone());
                        id
                    }
                };
                let review_key = format!("{}{}", collection.id, REVIEW_KEY_SUFFIX);
                let review_plan = plan_batches(&to_review, writer.batch_size(config.batch_size));
                let dest = WriteTarget {
                    job_id: &job.job_id,
                    checkpoint_collection_id: &review_key,
                    report_collection_id: &collection.id,
                    target_collection_id: &review_id,
                    dry_run,
                    review: true,
                };
                let written = writer.write_collection(&dest, &review_plan, &mut state.reporter);
                if let Err(stop) = written {
                    state.stopped_at = Some(StopPoint {
                        collection_id: review_key.clone(),
                        batch_index: stop.batch_index,
                    });
                    return Err(stop.error);
                }
            }

            info!(collection = %collection.id, tracks = snapshot.tracks.len(), "collection done");
        }

        Ok(())
    }

    fn find_or_register(&self, identity: JobIdentity) -> Result<TransferJob, TransferError> {
        let store_err = |e: anyhow::Error| TransferError::Store(format!("{:#}", e));
        if let Some(job) = self.store.find_job(&identity.key()).map_err(store_err)? {
            info!(job_id = %job.job_id, "resuming registered job");
            return Ok(job);
        }
        let job = TransferJob::new(identity, false);
        self.store.register_job(&job).map_err(store_err)?;
        // A concurrent registration may have won; use whatever is stored
        Ok(self
            .store
            .find_job(&job.identity.key())
            .map_err(store_err)?
            .unwrap_or(job))
    }

    /// Resolves a target collection, retrying transient failures.
    fn resolve_collection(&self, name: &str) -> Result<String, TransferError> {
        if self.config.dry_run {
            return Ok(format!("dry-run:{}", name));
        }

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
            self.config.jitter_seed,
        );
        let mut rate_limited = 0u32;
        loop {
            let target = Arc::clone(&self.target);
            let request = name.to_string();
            let err = match call_with_deadline(self.config.operation_deadline(), move || {
                target.resolve_or_create_collection(&request)
            }) {
                Ok(id) => return Ok(id),
                Err(err) => err,
            };
            let give_up = || TransferError::TargetCollection {
                name: name.to_string(),
                message: err.to_string(),
            };
            match err.class() {
                ErrorClass::Fatal => return Err(TransferError::from_fatal(&err)),
                ErrorClass::Recorded => return Err(give_up()),
                ErrorClass::Retriable(RetryKind::RateLimit(delay)) => {
                    rate_limited += 1;
                    if rate_limited > self.config.max_rate_limit_retries {
                        return Err(give_up());
                    }
                    self.clock.sleep(delay);
                }
                ErrorClass::Retriable(RetryKind::Transient) => {
                    if backoff.attempt() >= self.config.max_retries {
                        return Err(give_up());
                    }
                    self.clock.sleep(backoff.next_delay());
                }
            }
        }
    }
}

fn source_failure(err: &ProviderError) -> TransferError {
    match err {
        ProviderError::Authorization(msg) => TransferError::Authorization(msg.clone()),
        other => TransferError::SourceUnavailable(other.to_string()),
    }
}

fn target_collection_name(collection: &Collection, config: &TransferConfig) -> String {
    match (collection.kind, &config.liked_collection_name) {
        (CollectionKind::Liked, Some(name)) => name.clone(),
        _ => collection.name.clone(),
    }
}
