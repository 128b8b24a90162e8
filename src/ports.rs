//! Capability interfaces consumed by the transfer pipeline.
//!
//! Provider adapters implement these traits; the pipeline only ever sees
//! `Arc<dyn ...>` handles. All methods are blocking and must be callable from
//! worker threads.

use crate::error::ProviderError;
use crate::models::{AddOutcome, Collection, MatchCandidate, TrackDescriptor};

/// Read access to the source catalog.
pub trait SourceReader: Send + Sync {
    /// Identifier of the provider, part of the job identity.
    fn provider_id(&self) -> &str;

    fn list_collections(&self) -> Result<Vec<Collection>, ProviderError>;

    /// Every track of a collection, in source order. Pagination is internal.
    fn list_tracks(&self, collection_id: &str) -> Result<Vec<TrackDescriptor>, ProviderError>;
}

/// Candidate search in the target catalog.
pub trait TargetSearch: Send + Sync {
    fn find_candidates(
        &self,
        track: &TrackDescriptor,
        top_k: usize,
    ) -> Result<Vec<MatchCandidate>, ProviderError>;
}

/// Write access to the target catalog (append only).
pub trait TargetWriter: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Largest batch `add_tracks_batch` accepts.
    fn max_batch_size(&self) -> usize;

    fn resolve_or_create_collection(&self, name: &str) -> Result<String, ProviderError>;

    fn add_tracks_batch(
        &self,
        collection_id: &str,
        target_ids: &[String],
    ) -> Result<AddOutcome, ProviderError>;

    /// True when re-adding an id already in the collection is reported as a
    /// duplicate rather than added twice. Writes to targets without this run
    /// with no deadline, so an abandoned call never overlaps its retry.
    fn dedups_writes(&self) -> bool {
        true
    }
}
