//! Reporter: per-track, per-collection and job-level outcomes.
//!
//! The reporter only observes. Nothing it records feeds back into retry or
//! abort decisions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{
    AddOutcome, CheckpointStatus, Collection, CollectionKind, EntryError, MatchCandidate,
    MatchResult, MatchStage, MatchStatus, StopPoint,
};

// ============================================================================
// Report Models
// ============================================================================

/// Final status of one source track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Added,
    /// Same target track as an earlier entry of the collection
    Duplicate,
    /// Written by a previous run of the same job
    AlreadyWritten,
    NotFound,
    Ambiguous,
    Error,
    SkippedDryRun,
    /// Matched but never attempted because the job stopped
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub collection_id: String,
    pub source_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub status: TrackStatus,
    pub match_status: MatchStatus,
    pub stage: Option<MatchStage>,
    pub confidence: f64,
    pub reason: String,
    pub target_id: Option<String>,
    pub top_candidates: Vec<MatchCandidate>,
    /// Candidate appended to the manual-review collection
    #[serde(default)]
    pub review_target_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub collection_id: String,
    pub name: String,
    pub kind: Option<CollectionKind>,
    pub target_collection_id: Option<String>,
    pub tracks: usize,
    pub matched: usize,
    pub not_found: usize,
    pub ambiguous: usize,
    pub added: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub batches: usize,
    pub skipped_batches: usize,
    pub failed_batches: usize,
    pub review_added: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub match_rate: f64,
    pub write_success_rate: f64,
    pub retry_count: u64,
    pub rl_wait_ms: u64,
    pub duration_ms: u64,
}

/// One batch submitted to the target during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub collection_id: String,
    pub batch_index: usize,
    pub review: bool,
    pub status: CheckpointStatus,
    pub tracks: usize,
    pub added: usize,
    pub duplicates: usize,
    pub errors: usize,
    /// Calls made for this batch in this run
    pub attempts: u32,
    pub retries: u32,
    pub rl_wait_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_provider_id: String,
    pub target_provider_id: String,
    pub snapshot_hash: String,
    pub dry_run: bool,
    pub status: JobStatus,
    pub stopped_at: Option<StopPoint>,
    pub error: Option<String>,
}

/// Finalized, immutable job report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReport {
    pub header: ReportHeader,
    pub per_collection: Vec<CollectionSummary>,
    pub per_track: Vec<TrackEntry>,
    #[serde(default)]
    pub per_batch: Vec<BatchMetrics>,
    pub metrics: JobMetrics,
}

impl TransferReport {
    /// Report key: (job id, snapshot hash, finish timestamp).
    pub fn key(&self) -> (String, String, String) {
        (
            self.header.job_id.clone(),
            self.header.snapshot_hash.clone(),
            self.header.finished_at.format("%Y%m%dT%H%M%SZ").to_string(),
        )
    }

    pub fn file_name(&self) -> String {
        let (job_id, _, timestamp) = self.key();
        format!("transfer_report_{}_{}.json", job_id, timestamp)
    }

    pub fn collection(&self, collection_id: &str) -> Option<&CollectionSummary> {
        self.per_collection.iter().find(|c| c.collection_id == collection_id)
    }

    pub fn count_status(&self, status: TrackStatus) -> usize {
        self.per_track.iter().filter(|t| t.status == status).count()
    }

    /// Write report to a JSON file
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(())
    }

    /// Writes the report into `dir` under its canonical file name.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let path = dir.join(self.file_name());
        self.write_to_file(&path)?;
        Ok(path)
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Result of one batch submission as seen by the reporter.
#[derive(Debug, Clone, Copy)]
pub enum BatchResult<'a> {
    /// Recorded as written by an earlier run
    Skipped,
    /// Dry run
    Simulated,
    Written(&'a AddOutcome),
    /// Retries exhausted
    Failed(&'a str),
}

/// One track routed into a batch: (entry index, target id).
pub type BatchEntry = (usize, String);

#[derive(Debug)]
pub struct Reporter {
    job_id: String,
    snapshot_hash: String,
    started_at: DateTime<Utc>,
    source_provider_id: String,
    target_provider_id: String,
    dry_run: bool,
    collections: Vec<CollectionSummary>,
    collection_index: FxHashMap<String, usize>,
    entries: Vec<TrackEntry>,
    batches: Vec<BatchMetrics>,
    retry_count: u64,
    rl_wait_ms: u64,
    attempted_entries: usize,
    successful_entries: usize,
}

impl Reporter {
    pub fn new(
        source_provider_id: &str,
        target_provider_id: &str,
        dry_run: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: String::new(),
            snapshot_hash: String::new(),
            started_at,
            source_provider_id: source_provider_id.to_string(),
            target_provider_id: target_provider_id.to_string(),
            dry_run,
            collections: Vec::new(),
            collection_index: FxHashMap::default(),
            entries: Vec::new(),
            batches: Vec::new(),
            retry_count: 0,
            rl_wait_ms: 0,
            attempted_entries: 0,
            successful_entries: 0,
        }
    }

    pub fn set_job(&mut self, job_id: &str, snapshot_hash: &str) {
        self.job_id = job_id.to_string();
        self.snapshot_hash = snapshot_hash.to_string();
    }

    pub fn begin_collection(&mut self, collection: &Collection) {
        if self.collection_index.contains_key(&collection.id) {
            return;
        }
        self.collection_index.insert(collection.id.clone(), self.collections.len());
        self.collections.push(CollectionSummary {
            collection_id: collection.id.clone(),
            name: collection.name.clone(),
            kind: Some(collection.kind),
            ..Default::default()
        });
    }

    fn summary_mut(&mut self, collection_id: &str) -> &mut CollectionSummary {
        let idx = match self.collection_index.get(collection_id) {
            Some(idx) => *idx,
            None => {
                self.collection_index.insert(collection_id.to_string(), self.collections.len());
                self.collections.push(CollectionSummary {
                    collection_id: collection_id.to_string(),
                    ..Default::default()
                });
                self.collections.len() - 1
            }
        };
        &mut self.collections[idx]
    }

    pub fn set_target_collection(&mut self, collection_id: &str, target_collection_id: &str) {
        self.summary_mut(collection_id).target_collection_id =
            Some(target_collection_id.to_string());
    }

    /// Records a match outcome and returns the entry index used by later
    /// batch updates. `invalid` marks descriptors rejected before matching.
    pub fn record_match(
        &mut self,
        collection_id: &str,
        result: &MatchResult,
        invalid: bool,
    ) -> usize {
        let status = match result.status {
            _ if invalid => TrackStatus::Error,
            MatchStatus::Matched => TrackStatus::Pending,
            MatchStatus::NotFound => TrackStatus::NotFound,
            MatchStatus::Ambiguous => TrackStatus::Ambiguous,
        };

        let summary = self.summary_mut(collection_id);
        summary.tracks += 1;
        match result.status {
            MatchStatus::Matched => summary.matched += 1,
            MatchStatus::NotFound => summary.not_found += 1,
            MatchStatus::Ambiguous => summary.ambiguous += 1,
        }
        if invalid {
            summary.errors += 1;
        }

        self.entries.push(TrackEntry {
            collection_id: collection_id.to_string(),
            source_id: result.source_track.source_id.clone(),
            title: result.source_track.title.clone(),
            artists: result.source_track.artists.clone(),
            status,
            match_status: result.status,
            stage: result.stage,
            confidence: result.confidence,
            reason: result.reason.clone(),
            target_id: result.target_id().map(str::to_string),
            top_candidates: result.top_candidates.clone(),
            review_target_id: None,
        });
        self.entries.len() - 1
    }

    /// Later occurrence of a target already planned for the collection.
    pub fn record_duplicate(&mut self, entry: usize) {
        let collection_id = self.entries[entry].collection_id.clone();
        self.entries[entry].status = TrackStatus::Duplicate;
        self.summary_mut(&collection_id).duplicates += 1;
    }

    pub fn record_batch(
        &mut self,
        collection_id: &str,
        entries: &[BatchEntry],
        result: BatchResult<'_>,
        review: bool,
    ) {
        if review {
            self.record_review_batch(collection_id, entries, result);
            return;
        }

        match result {
            BatchResult::Skipped => {
                self.summary_mut(collection_id).skipped_batches += 1;
                self.set_status(entries, TrackStatus::AlreadyWritten);
            }
            BatchResult::Simulated => {
                let summary = self.summary_mut(collection_id);
                summary.batches += 1;
                summary.added += entries.len();
                self.attempted_entries += entries.len();
                self.successful_entries += entries.len();
                self.set_status(entries, TrackStatus::SkippedDryRun);
            }
            BatchResult::Written(outcome) => {
                let failed: FxHashMap<&str, &str> = outcome
                    .errors
                    .iter()
                    .map(|e| (e.target_id.as_str(), e.message.as_str()))
                    .collect();
                let errored = entries
                    .iter()
                    .filter(|(_, id)| failed.contains_key(id.as_str()))
                    .count();

                let summary = self.summary_mut(collection_id);
                summary.batches += 1;
                summary.added += outcome.added;
                summary.duplicates += outcome.duplicates;
                summary.errors += errored;
                self.attempted_entries += entries.len();
                self.successful_entries += entries.len() - errored;

                for (entry, target_id) in entries {
                    let e = &mut self.entries[*entry];
                    match failed.get(target_id.as_str()) {
                        Some(message) => {
                            e.status = TrackStatus::Error;
                            e.reason = format!("write rejected: {}", message);
                        }
                        None => e.status = TrackStatus::Added,
                    }
                }
            }
            BatchResult::Failed(message) => {
                let summary = self.summary_mut(collection_id);
                summary.batches += 1;
                summary.failed_batches += 1;
                summary.errors += entries.len();
                self.attempted_entries += entries.len();
                for (entry, _) in entries {
                    let e = &mut self.entries[*entry];
                    e.status = TrackStatus::Error;
                    e.reason = format!("batch failed: {}", message);
                }
            }
        }
    }

    /// Entries of a batch checkpointed as written whose ids the target
    /// refused at the time. They were never written and stay errors.
    pub fn record_prior_rejections(
        &mut self,
        collection_id: &str,
        entries: &[BatchEntry],
        rejected: &[EntryError],
        review: bool,
    ) {
        if review {
            return;
        }
        let messages: FxHashMap<&str, &str> = rejected
            .iter()
            .map(|e| (e.target_id.as_str(), e.message.as_str()))
            .collect();
        self.summary_mut(collection_id).errors += entries.len();
        for (entry, target_id) in entries {
            let e = &mut self.entries[*entry];
            e.status = TrackStatus::Error;
            e.reason = match messages.get(target_id.as_str()) {
                Some(message) => format!("write rejected: {}", message),
                None => "not written by an earlier run".to_string(),
            };
        }
    }

    fn record_review_batch(
        &mut self,
        collection_id: &str,
        entries: &[BatchEntry],
        result: BatchResult<'_>,
    ) {
        let rejected: FxHashSet<&str> = match result {
            BatchResult::Written(outcome) => {
                outcome.errors.iter().map(|e| e.target_id.as_str()).collect()
            }
            BatchResult::Failed(_) => entries.iter().map(|(_, id)| id.as_str()).collect(),
            BatchResult::Skipped | BatchResult::Simulated => FxHashSet::default(),
        };
        let mut accepted = 0;
        for (entry, target_id) in entries {
            if !rejected.contains(target_id.as_str()) {
                self.entries[*entry].review_target_id = Some(target_id.clone());
                accepted += 1;
            }
        }
        self.summary_mut(collection_id).review_added += accepted;
    }

    fn set_status(&mut self, entries: &[BatchEntry], status: TrackStatus) {
        for (entry, _) in entries {
            self.entries[*entry].status = status;
        }
    }

    pub fn record_batch_metrics(&mut self, metrics: BatchMetrics) {
        self.batches.push(metrics);
    }

    pub fn add_retries(&mut self, retries: u64) {
        self.retry_count += retries;
    }

    pub fn add_rl_wait(&mut self, wait_ms: u64) {
        self.rl_wait_ms += wait_ms;
    }

    pub fn entry(&self, index: usize) -> &TrackEntry {
        &self.entries[index]
    }

    pub fn metrics(&self, duration_ms: u64) -> JobMetrics {
        let tracks: usize = self.collections.iter().map(|c| c.tracks).sum();
        let matched: usize = self.collections.iter().map(|c| c.matched).sum();
        JobMetrics {
            match_rate: if tracks == 0 { 0.0 } else { matched as f64 / tracks as f64 },
            // Nothing attempted means nothing failed
            write_success_rate: if self.attempted_entries == 0 {
                1.0
            } else {
                self.successful_entries as f64 / self.attempted_entries as f64
            },
            retry_count: self.retry_count,
            rl_wait_ms: self.rl_wait_ms,
            duration_ms,
        }
    }

    /// Consumes the reporter and produces the immutable report.
    pub fn finalize(
        self,
        status: JobStatus,
        stopped_at: Option<StopPoint>,
        error: Option<String>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> TransferReport {
        let metrics = self.metrics(duration_ms);
        TransferReport {
            header: ReportHeader {
                job_id: self.job_id,
                started_at: self.started_at,
                finished_at,
                source_provider_id: self.source_provider_id,
                target_provider_id: self.target_provider_id,
                snapshot_hash: self.snapshot_hash,
                dry_run: self.dry_run,
                status,
                stopped_at,
                error,
            },
            per_collection: self.collections,
            per_track: self.entries,
            per_batch: self.batches,
            metrics,
        }
    }
}
