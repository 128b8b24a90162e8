//! Scripted fakes shared by unit tests.

use anyhow::{bail, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backoff::Clock;
use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::config::TransferConfig;
use crate::error::ProviderError;
use crate::models::{
    AddOutcome, BatchCheckpoint, Collection, CollectionKind, EntryError, EntryErrorKind,
    MatchCandidate, MatchResult, MatchStage, MatchStatus, TrackDescriptor, TransferJob,
};
use crate::ports::{SourceReader, TargetSearch, TargetWriter};

// ============================================================================
// Builders
// ============================================================================

pub fn track(source_id: &str, title: &str, artists: &[&str], duration_ms: u64) -> TrackDescriptor {
    TrackDescriptor {
        source_id: source_id.to_string(),
        title: title.to_string(),
        artists: artists.iter().map(|a| a.to_string()).collect(),
        duration_ms,
        isrc: None,
        album: None,
    }
}

pub fn track_isrc(
    source_id: &str,
    title: &str,
    artists: &[&str],
    duration_ms: u64,
    isrc: &str,
) -> TrackDescriptor {
    TrackDescriptor {
        isrc: Some(isrc.to_string()),
        ..track(source_id, title, artists, duration_ms)
    }
}

pub fn candidate(
    target_id: &str,
    title: &str,
    artists: &[&str],
    duration_ms: u64,
) -> MatchCandidate {
    MatchCandidate {
        target_id: target_id.to_string(),
        confidence: 0.5,
        reason: "search".to_string(),
        title: Some(title.to_string()),
        artists: artists.iter().map(|a| a.to_string()).collect(),
        duration_ms: Some(duration_ms),
        isrc: None,
        album: None,
    }
}

pub fn matched_result(source_id: &str, target_id: &str) -> MatchResult {
    let c = candidate(target_id, "Song", &["X"], 200_000);
    MatchResult {
        source_track: track(source_id, "Song", &["X"], 200_000),
        chosen: Some(c.clone()),
        stage: Some(MatchStage::Exact),
        confidence: 0.99,
        status: MatchStatus::Matched,
        reason: "exact".to_string(),
        top_candidates: vec![c],
    }
}

pub fn playlist(id: &str, name: &str) -> Collection {
    Collection {
        id: id.to_string(),
        name: name.to_string(),
        kind: CollectionKind::Playlist,
        track_count: 0,
    }
}

/// Config with inline calls, seeded jitter and no progress bars.
pub fn engine_config() -> TransferConfig {
    TransferConfig {
        operation_deadline_ms: 0,
        jitter_seed: Some(7),
        match_workers: 2,
        show_progress: false,
        ..TransferConfig::default()
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Records sleeps and advances virtual time instead of sleeping.
#[derive(Default)]
pub struct FakeClock {
    now_ms: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn total_slept_ms(&self) -> u64 {
        self.sleeps().iter().map(|d| d.as_millis() as u64).sum()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.now_ms.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        self.sleeps.lock().unwrap().push(duration);
    }
}

// ============================================================================
// Source
// ============================================================================

pub struct FakeSource {
    provider_id: String,
    collections: Mutex<Vec<(Collection, Vec<TrackDescriptor>)>>,
    list_failure: Mutex<Option<ProviderError>>,
}

impl FakeSource {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            collections: Mutex::new(Vec::new()),
            list_failure: Mutex::new(None),
        }
    }

    pub fn with_collection(self, collection: Collection, tracks: Vec<TrackDescriptor>) -> Self {
        self.collections.lock().unwrap().push((collection, tracks));
        self
    }

    pub fn set_tracks(&self, collection_id: &str, tracks: Vec<TrackDescriptor>) {
        let mut collections = self.collections.lock().unwrap();
        if let Some((_, existing)) = collections.iter_mut().find(|(c, _)| c.id == collection_id) {
            *existing = tracks;
        }
    }

    pub fn fail_listing(&self, err: ProviderError) {
        *self.list_failure.lock().unwrap() = Some(err);
    }
}

impl SourceReader for FakeSource {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn list_collections(&self) -> Result<Vec<Collection>, ProviderError> {
        if let Some(err) = self.list_failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .collections
            .lock()
            .unwrap()
            .iter()
            .map(|(c, tracks)| Collection {
                track_count: tracks.len(),
                ..c.clone()
            })
            .collect())
    }

    fn list_tracks(&self, collection_id: &str) -> Result<Vec<TrackDescriptor>, ProviderError> {
        self.collections
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.id == collection_id)
            .map(|(_, tracks)| tracks.clone())
            .ok_or_else(|| {
                ProviderError::SourceUnavailable(format!("no collection {}", collection_id))
            })
    }
}

// ============================================================================
// Target
// ============================================================================

/// Target with scripted search results, scripted failures and an in-memory
/// catalog of collections.
pub struct FakeTarget {
    provider_id: String,
    max_batch_size: usize,
    write_delay: Duration,
    dedups_writes: bool,
    results: Mutex<FxHashMap<String, Vec<MatchCandidate>>>,
    search_failures: Mutex<VecDeque<Option<ProviderError>>>,
    search_calls: AtomicUsize,
    write_failures: Mutex<VecDeque<Option<ProviderError>>>,
    rejected: Mutex<FxHashSet<String>>,
    write_calls: Mutex<Vec<(String, Vec<String>)>>,
    collections: Mutex<Vec<(String, Vec<String>)>>,
    created: Mutex<Vec<String>>,
}

impl FakeTarget {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            max_batch_size: 100,
            write_delay: Duration::ZERO,
            dedups_writes: true,
            results: Mutex::new(FxHashMap::default()),
            search_failures: Mutex::new(VecDeque::new()),
            search_calls: AtomicUsize::new(0),
            write_failures: Mutex::new(VecDeque::new()),
            rejected: Mutex::new(FxHashSet::default()),
            write_calls: Mutex::new(Vec::new()),
            collections: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Every write call blocks this long before taking effect.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn without_write_dedup(mut self) -> Self {
        self.dedups_writes = false;
        self
    }

    pub fn set_results(&self, source_id: &str, candidates: Vec<MatchCandidate>) {
        self.results.lock().unwrap().insert(source_id.to_string(), candidates);
    }

    /// One entry per upcoming search call; None lets the call through.
    pub fn fail_searches(&self, script: Vec<Option<ProviderError>>) {
        self.search_failures.lock().unwrap().extend(script);
    }

    /// One entry per upcoming write call; None lets the call through.
    pub fn fail_writes(&self, script: Vec<Option<ProviderError>>) {
        self.write_failures.lock().unwrap().extend(script);
    }

    pub fn reject_ids(&self, ids: &[&str]) {
        self.rejected.lock().unwrap().extend(ids.iter().map(|s| s.to_string()));
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Every write attempt, failed ones included.
    pub fn write_calls(&self) -> Vec<(String, Vec<String>)> {
        self.write_calls.lock().unwrap().clone()
    }

    pub fn collection_contents(&self, collection_id: &str) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == collection_id)
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default()
    }

    pub fn created_collections(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl TargetSearch for FakeTarget {
    fn find_candidates(
        &self,
        track: &TrackDescriptor,
        top_k: usize,
    ) -> Result<Vec<MatchCandidate>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Some(err)) = self.search_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut found = self
            .results
            .lock()
            .unwrap()
            .get(&track.source_id)
            .cloned()
            .unwrap_or_default();
        found.truncate(top_k);
        Ok(found)
    }
}

impl TargetWriter for FakeTarget {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn dedups_writes(&self) -> bool {
        self.dedups_writes
    }

    fn resolve_or_create_collection(&self, name: &str) -> Result<String, ProviderError> {
        let id = format!("tgt-{}", name);
        let mut created = self.created.lock().unwrap();
        if !created.contains(&name.to_string()) {
            created.push(name.to_string());
        }
        Ok(id)
    }

    fn add_tracks_batch(
        &self,
        collection_id: &str,
        target_ids: &[String],
    ) -> Result<AddOutcome, ProviderError> {
        self.write_calls
            .lock()
            .unwrap()
            .push((collection_id.to_string(), target_ids.to_vec()));
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        if let Some(Some(err)) = self.write_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let rejected = self.rejected.lock().unwrap().clone();
        let mut collections = self.collections.lock().unwrap();
        let idx = match collections.iter().position(|(id, _)| id == collection_id) {
            Some(idx) => idx,
            None => {
                collections.push((collection_id.to_string(), Vec::new()));
                collections.len() - 1
            }
        };
        let contents = &mut collections[idx].1;

        let mut outcome = AddOutcome::default();
        for id in target_ids {
            if rejected.contains(id) {
                outcome.errors.push(EntryError {
                    target_id: id.clone(),
                    kind: EntryErrorKind::NotFound,
                    message: format!("unknown track {}", id),
                });
            } else if contents.contains(id) {
                outcome.duplicates += 1;
            } else {
                contents.push(id.clone());
                outcome.added += 1;
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Memory store whose first N saves fail.
pub struct FlakyStore {
    pub inner: MemoryCheckpointStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

impl CheckpointStore for FlakyStore {
    fn find_job(&self, identity_key: &str) -> Result<Option<TransferJob>> {
        self.inner.find_job(identity_key)
    }

    fn register_job(&self, job: &TransferJob) -> Result<()> {
        self.inner.register_job(job)
    }

    fn load(&self, job_id: &str, collection_id: &str) -> Result<Vec<BatchCheckpoint>> {
        self.inner.load(job_id, collection_id)
    }

    fn load_all(&self, job_id: &str) -> Result<Vec<BatchCheckpoint>> {
        self.inner.load_all(job_id)
    }

    fn save(&self, checkpoint: &BatchCheckpoint) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            bail!("disk I/O error");
        }
        self.inner.save(checkpoint)
    }

    fn try_acquire_lock(&self, key: &str, holder: &str, stale_after: Duration) -> Result<bool> {
        self.inner.try_acquire_lock(key, holder, stale_after)
    }

    fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        self.inner.release_lock(key, holder)
    }
}
