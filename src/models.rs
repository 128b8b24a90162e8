//! Core data models for library transfers.
//!
//! This module contains the track, candidate, match, job and checkpoint types
//! shared by every stage of the transfer pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Source Models
// ============================================================================

/// Kind of source collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// The user's liked/saved tracks
    Liked,
    Playlist,
}

/// A source collection (liked tracks or an owned playlist).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub kind: CollectionKind,
    #[serde(default)]
    pub track_count: usize,
}

/// Track as read from the source catalog. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub source_id: String,
    pub title: String,
    pub artists: Vec<String>, // Credited order, must be non-empty
    pub duration_ms: u64,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
}

impl TrackDescriptor {
    /// ISRC trimmed and upper-cased, or None when absent/blank.
    pub fn isrc_normalized(&self) -> Option<String> {
        normalize_isrc(self.isrc.as_deref())
    }

    /// Returns a reason when the descriptor cannot be matched at all.
    pub fn validation_error(&self) -> Option<String> {
        if self.artists.iter().all(|a| a.trim().is_empty()) && self.isrc_normalized().is_none() {
            return Some("track has no artists and no ISRC".to_string());
        }
        if self.title.trim().is_empty() && self.isrc_normalized().is_none() {
            return Some("track has no title and no ISRC".to_string());
        }
        None
    }
}

pub(crate) fn normalize_isrc(isrc: Option<&str>) -> Option<String> {
    isrc.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty())
}

// ============================================================================
// Target Models
// ============================================================================

/// Candidate returned by the target search capability.
///
/// `confidence` is whatever the provider reported; the matching engine
/// recomputes its own confidence from the metadata fields when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub target_id: String,
    pub confidence: f64,
    pub reason: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
}

/// Entry-level failure reported by the write capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryErrorKind {
    PermanentFailure,
    NotFound,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub target_id: String,
    pub kind: EntryErrorKind,
    pub message: String,
}

/// Result of one `add_tracks_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOutcome {
    pub added: usize,
    pub duplicates: usize,
    pub errors: Vec<EntryError>,
}

// ============================================================================
// Match Models
// ============================================================================

/// Matching stage that produced an accepted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStage {
    Isrc,
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    NotFound,
    Ambiguous,
}

/// One per source track, immutable once computed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub source_track: TrackDescriptor,
    pub chosen: Option<MatchCandidate>,
    /// Stage that accepted `chosen`; None when nothing was accepted.
    pub stage: Option<MatchStage>,
    pub confidence: f64,
    pub status: MatchStatus,
    pub reason: String,
    /// Up to top-K candidates with engine-computed confidence, best first.
    pub top_candidates: Vec<MatchCandidate>,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.status == MatchStatus::Matched
    }

    pub fn target_id(&self) -> Option<&str> {
        match self.status {
            MatchStatus::Matched => self.chosen.as_ref().map(|c| c.target_id.as_str()),
            _ => None,
        }
    }
}

// ============================================================================
// Job Models
// ============================================================================

/// Idempotency key of a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub user_id: String,
    pub source_provider_id: String,
    pub target_provider_id: String,
    pub snapshot_hash: String,
}

impl JobIdentity {
    /// Stable string form used as the lock and registry key.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.user_id, self.source_provider_id, self.target_provider_id, self.snapshot_hash
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub job_id: String,
    pub identity: JobIdentity,
    pub created_at: DateTime<Utc>,
    pub dry_run: bool,
}

impl TransferJob {
    pub fn new(identity: JobIdentity, dry_run: bool) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            identity,
            created_at: Utc::now(),
            dry_run,
        }
    }
}

// ============================================================================
// Checkpoint Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Batch reached the provider and its outcome is final
    Written,
    /// Retries exhausted; the batch is retried by the next run
    Failed,
}

impl CheckpointStatus {
    pub fn as_db(self) -> &'static str {
        match self {
            CheckpointStatus::Written => "written",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "written" => Some(CheckpointStatus::Written),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

/// Durable record of one batch attempt, keyed by (job, collection, batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub job_id: String,
    pub collection_id: String,
    pub batch_index: usize,
    pub status: CheckpointStatus,
    /// SHA-256 over the batch's ordered target ids at planning time
    pub batch_digest: String,
    pub written_target_ids: Vec<String>,
    /// Entries the target refused in this batch; never written
    #[serde(default)]
    pub rejected: Vec<EntryError>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl BatchCheckpoint {
    pub fn is_written(&self) -> bool {
        self.status == CheckpointStatus::Written
    }
}

/// Last unit a job attempted before stopping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPoint {
    pub collection_id: String,
    pub batch_index: Option<usize>,
}
