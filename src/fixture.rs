//! File-backed source and target catalogs for offline replays.
//!
//! A source fixture lists collections with their tracks. A target fixture is a
//! flat track catalog; its search scores every catalog track against the query
//! with the crate's own similarity functions, and its writes go to in-memory
//! collections that can be dumped after the run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::ProviderError;
use crate::models::{
    normalize_isrc, AddOutcome, Collection, CollectionKind, EntryError, EntryErrorKind,
    MatchCandidate, TrackDescriptor,
};
use crate::ports::{SourceReader, TargetSearch, TargetWriter};
use crate::scoring::{artist_set_similarity, title_similarity, NormalizedTrack, TITLE_WEIGHT};

/// Catalog tracks scoring below this are not returned by search
pub const SEARCH_MIN_SCORE: f64 = 0.5;

// ============================================================================
// Source Fixture
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCollection {
    pub id: String,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: CollectionKind,
    pub tracks: Vec<TrackDescriptor>,
}

fn default_kind() -> CollectionKind {
    CollectionKind::Playlist
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFixture {
    pub provider_id: String,
    pub collections: Vec<FixtureCollection>,
}

pub struct FixtureSource {
    fixture: SourceFixture,
}

impl FixtureSource {
    pub fn new(fixture: SourceFixture) -> Self {
        Self { fixture }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source fixture {}", path.display()))?;
        let fixture: SourceFixture = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse source fixture {}", path.display()))?;
        Ok(Self::new(fixture))
    }
}

impl SourceReader for FixtureSource {
    fn provider_id(&self) -> &str {
        &self.fixture.provider_id
    }

    fn list_collections(&self) -> Result<Vec<Collection>, ProviderError> {
        Ok(self
            .fixture
            .collections
            .iter()
            .map(|c| Collection {
                id: c.id.clone(),
                name: c.name.clone(),
                kind: c.kind,
                track_count: c.tracks.len(),
            })
            .collect())
    }

    fn list_tracks(&self, collection_id: &str) -> Result<Vec<TrackDescriptor>, ProviderError> {
        self.fixture
            .collections
            .iter()
            .find(|c| c.id == collection_id)
            .map(|c| c.tracks.clone())
            .ok_or_else(|| {
                ProviderError::SourceUnavailable(format!("unknown collection {}", collection_id))
            })
    }
}

// ============================================================================
// Target Fixture
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
}

impl CatalogTrack {
    fn to_candidate(&self, confidence: f64, reason: &str) -> MatchCandidate {
        MatchCandidate {
            target_id: self.id.clone(),
            confidence,
            reason: reason.to_string(),
            title: Some(self.title.clone()),
            artists: self.artists.clone(),
            duration_ms: self.duration_ms,
            isrc: self.isrc.clone(),
            album: self.album.clone(),
        }
    }
}

/// Target collection as stored in (and dumped from) the fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCollection {
    pub id: String,
    pub name: String,
    pub track_ids: Vec<String>,
}

fn default_max_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetFixture {
    pub provider_id: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    pub tracks: Vec<CatalogTrack>,
    /// Collections that already exist in the target account
    #[serde(default)]
    pub collections: Vec<TargetCollection>,
    /// Every Nth write call answers with a rate limit first
    #[serde(default)]
    pub rate_limit_every: Option<usize>,
    #[serde(default)]
    pub retry_after_ms: u64,
}

pub struct FixtureTarget {
    provider_id: String,
    max_batch_size: usize,
    catalog: Vec<(CatalogTrack, NormalizedTrack)>,
    collections: Mutex<Vec<TargetCollection>>,
    rate_limit_every: Option<usize>,
    retry_after_ms: u64,
    write_calls: AtomicUsize,
}

impl FixtureTarget {
    pub fn new(fixture: TargetFixture) -> Self {
        let catalog = fixture
            .tracks
            .into_iter()
            .map(|t| {
                let normalized = NormalizedTrack::from_candidate(&t.to_candidate(0.0, ""))
                    .unwrap_or(NormalizedTrack {
                        title: String::new(),
                        artists: Vec::new(),
                        artists_key: String::new(),
                        duration_ms: t.duration_ms,
                    });
                (t, normalized)
            })
            .collect();
        Self {
            provider_id: fixture.provider_id,
            max_batch_size: fixture.max_batch_size,
            catalog,
            collections: Mutex::new(fixture.collections),
            rate_limit_every: fixture.rate_limit_every.filter(|n| *n > 0),
            retry_after_ms: fixture.retry_after_ms,
            write_calls: AtomicUsize::new(0),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read target fixture {}", path.display()))?;
        let fixture: TargetFixture = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse target fixture {}", path.display()))?;
        Ok(Self::new(fixture))
    }

    /// Current state of every target collection.
    pub fn collections(&self) -> Vec<TargetCollection> {
        match self.collections.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn dump_collections(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.collections())?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn lock_collections(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Vec<TargetCollection>>, ProviderError> {
        self.collections
            .lock()
            .map_err(|_| ProviderError::Temporary("collection state poisoned".to_string()))
    }
}

impl TargetSearch for FixtureTarget {
    fn find_candidates(
        &self,
        track: &TrackDescriptor,
        top_k: usize,
    ) -> Result<Vec<MatchCandidate>, ProviderError> {
        let query = NormalizedTrack::from_descriptor(track);
        let isrc = track.isrc_normalized();

        // (isrc hit, score, track); isrc hits rank above any text score
        let mut scored: Vec<(bool, f64, &CatalogTrack)> = self
            .catalog
            .iter()
            .filter_map(|(t, normalized)| {
                if isrc.is_some() && normalize_isrc(t.isrc.as_deref()) == isrc {
                    return Some((true, 1.0, t));
                }
                let score = TITLE_WEIGHT * title_similarity(&query.title, &normalized.title)
                    + (1.0 - TITLE_WEIGHT) * artist_set_similarity(&query, normalized);
                (score >= SEARCH_MIN_SCORE).then_some((false, score, t))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.total_cmp(&a.1))
                .then_with(|| a.2.id.cmp(&b.2.id))
        });
        scored.truncate(top_k);
        Ok(scored
            .into_iter()
            .map(|(by_isrc, score, t)| {
                t.to_candidate(score, if by_isrc { "isrc lookup" } else { "text search" })
            })
            .collect())
    }
}

impl TargetWriter for FixtureTarget {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn resolve_or_create_collection(&self, name: &str) -> Result<String, ProviderError> {
        let mut collections = self.lock_collections()?;
        if let Some(existing) = collections.iter().find(|c| c.name == name) {
            return Ok(existing.id.clone());
        }
        let id = format!("{}-col-{}", self.provider_id, collections.len() + 1);
        collections.push(TargetCollection {
            id: id.clone(),
            name: name.to_string(),
            track_ids: Vec::new(),
        });
        Ok(id)
    }

    fn add_tracks_batch(
        &self,
        collection_id: &str,
        target_ids: &[String],
    ) -> Result<AddOutcome, ProviderError> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(every) = self.rate_limit_every {
            // Call N of every N + 1 is throttled, so the retry goes through
            if call % (every + 1) == every {
                return Err(ProviderError::RateLimited {
                    retry_after_ms: self.retry_after_ms,
                });
            }
        }

        let mut collections = self.lock_collections()?;
        let collection = collections
            .iter_mut()
            .find(|c| c.id == collection_id)
            .ok_or_else(|| ProviderError::NotFound(format!("collection {}", collection_id)))?;

        let mut outcome = AddOutcome::default();
        for id in target_ids {
            if !self.catalog.iter().any(|(t, _)| &t.id == id) {
                outcome.errors.push(EntryError {
                    target_id: id.clone(),
                    kind: EntryErrorKind::NotFound,
                    message: format!("no catalog track {}", id),
                });
            } else if collection.track_ids.contains(id) {
                outcome.duplicates += 1;
            } else {
                collection.track_ids.push(id.clone());
                outcome.added += 1;
            }
        }
        Ok(outcome)
    }
}
