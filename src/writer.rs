//! Batch Writer: plans bounded batches and submits them to the target.
//!
//! Batches of one collection are written strictly in order. Each attempted
//! batch is checkpointed before the next one starts, and batches recorded as
//! written by an earlier run of the same job are never resubmitted.

use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, Clock};
use crate::checkpoint::CheckpointStore;
use crate::config::TransferConfig;
use crate::deadline::call_with_deadline;
use crate::error::{ErrorClass, RetryKind, TransferError};
use crate::models::{AddOutcome, BatchCheckpoint, CheckpointStatus, EntryError};
use crate::ports::TargetWriter;
use crate::report::{BatchEntry, BatchMetrics, BatchResult, Reporter};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative job cancellation, observed at batch boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Batch Planning
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub index: usize,
    /// (report entry, target id), target ids unique within the plan
    pub entries: Vec<BatchEntry>,
    pub digest: String,
}

impl PlannedBatch {
    pub fn target_ids(&self) -> Vec<String> {
        self.entries.iter().map(|(_, id)| id.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<PlannedBatch>,
    /// Entries whose target id already appears earlier in the plan
    pub duplicate_entries: Vec<usize>,
}

/// SHA-256 over the batch's ordered target ids.
pub fn batch_digest(target_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in target_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Deduplicates target ids in first-occurrence order and chunks them.
pub fn plan_batches(matched: &[BatchEntry], batch_size: usize) -> BatchPlan {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut unique: Vec<BatchEntry> = Vec::with_capacity(matched.len());
    let mut duplicate_entries = Vec::new();

    for (entry, target_id) in matched {
        if seen.insert(target_id.as_str()) {
            unique.push((*entry, target_id.clone()));
        } else {
            duplicate_entries.push(*entry);
        }
    }

    let batches = unique
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| {
            let ids: Vec<String> = chunk.iter().map(|(_, id)| id.clone()).collect();
            PlannedBatch {
                index,
                entries: chunk.to_vec(),
                digest: batch_digest(&ids),
            }
        })
        .collect();

    BatchPlan {
        batches,
        duplicate_entries,
    }
}

// ============================================================================
// Error Window
// ============================================================================

/// Batches with errors the window must hold before it can trip. A single
/// exhausted or rejected batch is recorded and writing continues.
const MIN_FAILING_BATCHES: usize = 2;

/// Write error rate over the trailing N batches.
#[derive(Debug)]
pub struct ErrorWindow {
    batches: VecDeque<(usize, usize)>,
    capacity: usize,
    min_entries: usize,
    threshold: f64,
}

impl ErrorWindow {
    pub fn new(capacity: usize, min_entries: usize, threshold: f64) -> Self {
        Self {
            batches: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            min_entries,
            threshold,
        }
    }

    /// Records one batch and returns the window's rate when it breaches the
    /// threshold.
    pub fn record(&mut self, entries: usize, errors: usize) -> Option<f64> {
        if self.batches.len() == self.capacity {
            self.batches.pop_front();
        }
        self.batches.push_back((entries, errors));

        let (total, failed) = self
            .batches
            .iter()
            .fold((0, 0), |(t, f), (e, err)| (t + e, f + err));
        let failing = self.batches.iter().filter(|(_, err)| *err > 0).count();
        if total == 0 || total < self.min_entries || failing < MIN_FAILING_BATCHES {
            return None;
        }
        let rate = failed as f64 / total as f64;
        (rate > self.threshold).then_some(rate)
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Where and how one collection is written.
#[derive(Debug, Clone)]
pub struct WriteTarget<'a> {
    pub job_id: &'a str,
    /// Key of the checkpoint records (source collection id, or its review key)
    pub checkpoint_collection_id: &'a str,
    /// Source collection the report rows belong to
    pub report_collection_id: &'a str,
    pub target_collection_id: &'a str,
    pub dry_run: bool,
    pub review: bool,
}

/// Terminal failure while writing a collection.
#[derive(Debug)]
pub struct WriteStop {
    pub error: TransferError,
    pub batch_index: Option<usize>,
}

enum Submission {
    Written(AddOutcome),
    Failed { message: String },
}

/// What one `submit` spent reaching its outcome.
#[derive(Debug, Default, Clone, Copy)]
struct SubmitStats {
    calls: u32,
    rl_wait_ms: u64,
}

pub struct BatchWriter {
    target: Arc<dyn TargetWriter>,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    error_window: ErrorWindow,
    max_retries: u32,
    max_rate_limit_retries: u32,
    checkpoint_max_failures: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    jitter_seed: Option<u64>,
    deadline: Option<Duration>,
    error_rate_threshold: f64,
}

impl BatchWriter {
    pub fn new(
        target: Arc<dyn TargetWriter>,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        config: &TransferConfig,
    ) -> Self {
        let deadline = if target.dedups_writes() {
            config.operation_deadline()
        } else {
            None
        };
        Self {
            target,
            store,
            clock,
            cancel,
            error_window: ErrorWindow::new(
                config.error_window_batches,
                config.error_window_min_entries,
                config.error_rate_threshold,
            ),
            max_retries: config.max_retries,
            max_rate_limit_retries: config.max_rate_limit_retries,
            checkpoint_max_failures: config.checkpoint_max_failures,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            jitter_seed: config.jitter_seed,
            deadline,
            error_rate_threshold: config.error_rate_threshold,
        }
    }

    /// Effective batch size: the configured size bounded by the provider's.
    pub fn batch_size(&self, configured: usize) -> usize {
        configured.min(self.target.max_batch_size()).max(1)
    }

    /// Writes every batch of `plan` in order.
    pub fn write_collection(
        &mut self,
        dest: &WriteTarget<'_>,
        plan: &BatchPlan,
        reporter: &mut Reporter,
    ) -> Result<(), WriteStop> {
        let previous: Vec<BatchCheckpoint> = if dest.dry_run {
            Vec::new()
        } else {
            self.store
                .load(dest.job_id, dest.checkpoint_collection_id)
                .map_err(|e| WriteStop {
                    error: TransferError::Store(format!("{:#}", e)),
                    batch_index: None,
                })?
        };

        let by_index: FxHashMap<usize, &BatchCheckpoint> =
            previous.iter().map(|c| (c.batch_index, c)).collect();
        let mut already_written: FxHashSet<String> = previous
            .iter()
            .filter(|c| c.is_written())
            .flat_map(|c| c.written_target_ids.iter().cloned())
            .collect();

        if !previous.is_empty() {
            info!(
                job_id = dest.job_id,
                collection = dest.checkpoint_collection_id,
                checkpoints = previous.len(),
                written_ids = already_written.len(),
                "resuming from checkpoints"
            );
        }

        for batch in &plan.batches {
            if self.cancel.is_cancelled() {
                info!(
                    collection = dest.checkpoint_collection_id,
                    batch = batch.index,
                    "cancelled at batch boundary"
                );
                return Err(WriteStop {
                    error: TransferError::Cancelled,
                    batch_index: Some(batch.index),
                });
            }

            let prior = by_index.get(&batch.index).copied();
            if let Some(cp) = prior {
                if cp.is_written() && cp.batch_digest == batch.digest {
                    let written: FxHashSet<&str> =
                        cp.written_target_ids.iter().map(String::as_str).collect();
                    let (done, refused): (Vec<BatchEntry>, Vec<BatchEntry>) = batch
                        .entries
                        .iter()
                        .cloned()
                        .partition(|(_, id)| written.contains(id.as_str()));
                    debug!(
                        collection = dest.checkpoint_collection_id,
                        batch = batch.index,
                        refused = refused.len(),
                        "batch already written, skipping"
                    );
                    reporter.record_batch(
                        dest.report_collection_id,
                        &done,
                        BatchResult::Skipped,
                        dest.review,
                    );
                    if !refused.is_empty() {
                        reporter.record_prior_rejections(
                            dest.report_collection_id,
                            &refused,
                            &cp.rejected,
                            dest.review,
                        );
                    }
                    continue;
                }
                if cp.is_written() {
                    warn!(
                        collection = dest.checkpoint_collection_id,
                        batch = batch.index,
                        "batch contents changed since checkpoint, resubmitting unwritten ids"
                    );
                }
            }

            let (done, pending): (Vec<BatchEntry>, Vec<BatchEntry>) = batch
                .entries
                .iter()
                .cloned()
                .partition(|(_, id)| already_written.contains(id));
            if !done.is_empty() {
                reporter.record_batch(
                    dest.report_collection_id,
                    &done,
                    BatchResult::Skipped,
                    dest.review,
                );
            }
            if pending.is_empty() {
                continue;
            }

            if dest.dry_run {
                debug!(
                    collection = dest.checkpoint_collection_id,
                    batch = batch.index,
                    size = pending.len(),
                    "dry run, simulating batch"
                );
                reporter.record_batch(
                    dest.report_collection_id,
                    &pending,
                    BatchResult::Simulated,
                    dest.review,
                );
                continue;
            }

            let ids: Vec<String> = pending.iter().map(|(_, id)| id.clone()).collect();
            let prior_attempts = prior.map_or(0, |cp| cp.attempts);
            let started_ms = self.clock.now_ms();
            let (submission, stats) = self.submit(dest, batch.index, &ids, reporter)?;

            let (status, newly_written, rejected) = match &submission {
                Submission::Written(outcome) => {
                    let refused: FxHashSet<&str> =
                        outcome.errors.iter().map(|e| e.target_id.as_str()).collect();
                    let written: Vec<String> = ids
                        .iter()
                        .filter(|id| !refused.contains(id.as_str()))
                        .cloned()
                        .collect();
                    (CheckpointStatus::Written, written, outcome.errors.clone())
                }
                Submission::Failed { .. } => (CheckpointStatus::Failed, Vec::new(), Vec::new()),
            };
            let failed_entries = ids.len() - newly_written.len();
            // Ids of this batch written by earlier runs stay on its record
            let mut written: Vec<String> = done.iter().map(|(_, id)| id.clone()).collect();
            written.extend(newly_written);

            let checkpoint = BatchCheckpoint {
                job_id: dest.job_id.to_string(),
                collection_id: dest.checkpoint_collection_id.to_string(),
                batch_index: batch.index,
                status,
                batch_digest: batch.digest.clone(),
                written_target_ids: written.clone(),
                rejected,
                attempts: prior_attempts + stats.calls,
                updated_at: Utc::now(),
            };
            self.persist(&checkpoint)?;
            already_written.extend(written);

            match &submission {
                Submission::Written(outcome) => {
                    info!(
                        collection = dest.checkpoint_collection_id,
                        batch = batch.index,
                        added = outcome.added,
                        duplicates = outcome.duplicates,
                        errors = outcome.errors.len(),
                        "batch written"
                    );
                    reporter.record_batch(
                        dest.report_collection_id,
                        &pending,
                        BatchResult::Written(outcome),
                        dest.review,
                    );
                }
                Submission::Failed { message } => {
                    reporter.record_batch(
                        dest.report_collection_id,
                        &pending,
                        BatchResult::Failed(message),
                        dest.review,
                    );
                }
            }
            let (added, duplicates) = match &submission {
                Submission::Written(outcome) => (outcome.added, outcome.duplicates),
                Submission::Failed { .. } => (0, 0),
            };
            reporter.record_batch_metrics(BatchMetrics {
                collection_id: dest.report_collection_id.to_string(),
                batch_index: batch.index,
                review: dest.review,
                status,
                tracks: ids.len(),
                added,
                duplicates,
                errors: failed_entries,
                attempts: stats.calls,
                retries: stats.calls.saturating_sub(1),
                rl_wait_ms: stats.rl_wait_ms,
                duration_ms: self.clock.now_ms().saturating_sub(started_ms),
            });

            if let Some(rate) = self.error_window.record(ids.len(), failed_entries) {
                error!(
                    rate,
                    threshold = self.error_rate_threshold,
                    "write error rate over threshold, aborting"
                );
                return Err(WriteStop {
                    error: TransferError::ErrorRateExceeded {
                        rate,
                        threshold: self.error_rate_threshold,
                    },
                    batch_index: Some(batch.index),
                });
            }
        }

        Ok(())
    }

    /// Submits one batch until it reaches a final outcome. Returns the
    /// outcome with the calls made and the rate-limit time waited.
    fn submit(
        &self,
        dest: &WriteTarget<'_>,
        batch_index: usize,
        ids: &[String],
        reporter: &mut Reporter,
    ) -> Result<(Submission, SubmitStats), WriteStop> {
        let mut backoff = Backoff::new(
            self.backoff_base,
            self.backoff_max,
            self.jitter_seed.map(|s| s.wrapping_add(batch_index as u64)),
        );
        let mut consecutive_rate_limits = 0u32;
        let mut stats = SubmitStats::default();

        loop {
            stats.calls += 1;
            let target = Arc::clone(&self.target);
            let collection_id = dest.target_collection_id.to_string();
            let request = ids.to_vec();
            let result = call_with_deadline(self.deadline, move || {
                target.add_tracks_batch(&collection_id, &request)
            });

            let err = match result {
                Ok(outcome) => return Ok((Submission::Written(outcome), stats)),
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Fatal => {
                    error!(batch = batch_index, error = %err, "fatal write failure");
                    return Err(WriteStop {
                        error: TransferError::from_fatal(&err),
                        batch_index: Some(batch_index),
                    });
                }
                ErrorClass::Recorded => {
                    warn!(batch = batch_index, error = %err, "batch rejected, recording entries");
                    let kind = err.entry_kind();
                    let outcome = AddOutcome {
                        added: 0,
                        duplicates: 0,
                        errors: ids
                            .iter()
                            .map(|id| EntryError {
                                target_id: id.clone(),
                                kind,
                                message: err.to_string(),
                            })
                            .collect(),
                    };
                    return Ok((Submission::Written(outcome), stats));
                }
                ErrorClass::Retriable(RetryKind::RateLimit(delay)) => {
                    consecutive_rate_limits += 1;
                    if consecutive_rate_limits > self.max_rate_limit_retries {
                        error!(
                            batch = batch_index,
                            retries = self.max_rate_limit_retries,
                            "rate limit persisted, escalating"
                        );
                        return Err(WriteStop {
                            error: TransferError::RateLimitEscalation {
                                collection_id: dest.checkpoint_collection_id.to_string(),
                                batch_index,
                                retries: self.max_rate_limit_retries,
                            },
                            batch_index: Some(batch_index),
                        });
                    }
                    let delay_ms = delay.as_millis() as u64;
                    warn!(batch = batch_index, delay_ms, "rate limited, waiting");
                    self.clock.sleep(delay);
                    stats.rl_wait_ms += delay_ms;
                    reporter.add_rl_wait(delay_ms);
                }
                ErrorClass::Retriable(RetryKind::Transient) => {
                    consecutive_rate_limits = 0;
                    if backoff.attempt() >= self.max_retries {
                        warn!(
                            batch = batch_index,
                            attempts = stats.calls,
                            error = %err,
                            "retries exhausted, batch failed"
                        );
                        return Ok((
                            Submission::Failed {
                                message: err.to_string(),
                            },
                            stats,
                        ));
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        batch = batch_index,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient write failure, backing off"
                    );
                    self.clock.sleep(delay);
                }
            }
            reporter.add_retries(1);
        }
    }

    /// Saves a checkpoint, retrying local failures before giving up.
    fn persist(&self, checkpoint: &BatchCheckpoint) -> Result<(), WriteStop> {
        let mut last_error = String::new();
        for attempt in 1..=self.checkpoint_max_failures {
            match self.store.save(checkpoint) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    warn!(
                        batch = checkpoint.batch_index,
                        attempt,
                        "checkpoint save failed: {}",
                        last_error
                    );
                    if attempt < self.checkpoint_max_failures {
                        self.clock.sleep(self.backoff_base);
                    }
                }
            }
        }
        Err(WriteStop {
            error: TransferError::CheckpointPersistence {
                attempts: self.checkpoint_max_failures,
                message: last_error,
            },
            batch_index: Some(checkpoint.batch_index),
        })
    }
}
