//! Snapshot Builder: reads a source collection and fingerprints it.
//!
//! The fingerprint is a SHA-256 over the sorted, deduplicated set of canonical
//! track keys, so it does not depend on track order or on duplicate reads.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::deadline::call_with_deadline;
use crate::error::ProviderError;
use crate::models::{Collection, TrackDescriptor};
use crate::normalize::canonical_key;
use crate::ports::SourceReader;

/// Duration bucket used by canonical keys.
pub const FINGERPRINT_BUCKET_MS: u64 = 2000;

/// Tracks of one collection, in source order, plus their fingerprint.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub collection: Collection,
    pub tracks: Vec<TrackDescriptor>,
    pub snapshot_hash: String,
    /// (source_id, reason) for descriptors that cannot be matched
    pub invalid: Vec<(String, String)>,
}

fn sha256_lines<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for (i, line) in lines.enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Order-independent fingerprint of a track list.
pub fn fingerprint(tracks: &[TrackDescriptor]) -> String {
    let keys: BTreeSet<String> = tracks
        .iter()
        .map(|t| canonical_key(t, FINGERPRINT_BUCKET_MS))
        .collect();
    sha256_lines(keys.iter().map(String::as_str))
}

/// Job-level fingerprint over every selected collection's fingerprint.
pub fn job_snapshot_hash(snapshots: &[Snapshot]) -> String {
    let lines: BTreeSet<String> = snapshots
        .iter()
        .map(|s| format!("{}\t{}", s.collection.id, s.snapshot_hash))
        .collect();
    sha256_lines(lines.iter().map(String::as_str))
}

pub struct SnapshotBuilder {
    source: Arc<dyn SourceReader>,
    deadline: Option<Duration>,
}

impl SnapshotBuilder {
    pub fn new(source: Arc<dyn SourceReader>, deadline: Option<Duration>) -> Self {
        Self { source, deadline }
    }

    /// Reads the whole collection. Read failures are surfaced, not retried:
    /// the source adapter owns its own retry policy.
    pub fn build(&self, collection: &Collection) -> Result<Snapshot, ProviderError> {
        let source = Arc::clone(&self.source);
        let collection_id = collection.id.clone();
        let tracks = call_with_deadline(self.deadline, move || source.list_tracks(&collection_id))?;

        let invalid: Vec<(String, String)> = tracks
            .iter()
            .filter_map(|t| t.validation_error().map(|reason| (t.source_id.clone(), reason)))
            .collect();
        for (source_id, reason) in &invalid {
            warn!(collection = %collection.id, track = %source_id, "invalid track: {}", reason);
        }

        let snapshot_hash = fingerprint(&tracks);
        debug!(collection = %collection.id, hash = %snapshot_hash, "fingerprinted collection");
        info!(
            collection = %collection.id,
            name = %collection.name,
            tracks = tracks.len(),
            invalid = invalid.len(),
            "snapshot complete"
        );

        Ok(Snapshot {
            collection: collection.clone(),
            tracks,
            snapshot_hash,
            invalid,
        })
    }
}
