//! Scoring functions for cross-catalog track matching.
//!
//! This module contains:
//! - Duration tolerance checks
//! - Title and artist similarity
//! - Exact-stage confidence
//! - Fuzzy-stage combined scoring

use rustc_hash::FxHashSet;
use strsim::normalized_levenshtein;

use crate::models::{MatchCandidate, TrackDescriptor};
use crate::normalize::{normalize_artist_set, normalize_title};

// ============================================================================
// Score Thresholds
// ============================================================================

/// Lowest confidence assigned by the exact stage
pub const EXACT_BASE_CONFIDENCE: f64 = 0.95;

/// Highest confidence assigned by the exact stage (1.0 is reserved for ISRC)
pub const EXACT_MAX_CONFIDENCE: f64 = 0.99;

/// Fuzzy candidates whose artists are this dissimilar are rejected outright
pub const MIN_ARTIST_SIMILARITY: f64 = 0.3;

/// Title weight in the fuzzy score; artists get the remainder
pub const TITLE_WEIGHT: f64 = 0.7;

/// Duration factor applied when the candidate carries no duration
pub const UNKNOWN_DURATION_FACTOR: f64 = 0.9;

/// Duration factor at the edge of the fuzzy tolerance
pub const MIN_DURATION_FACTOR: f64 = 0.9;

// ============================================================================
// Normalized Views
// ============================================================================

/// Precomputed normalized fields of a source track or candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTrack {
    pub title: String,
    pub artists: Vec<String>,
    pub artists_key: String,
    pub duration_ms: Option<u64>,
}

impl NormalizedTrack {
    pub fn from_descriptor(track: &TrackDescriptor) -> Self {
        Self::build(&track.title, &track.artists, Some(track.duration_ms))
    }

    /// None when the candidate carries no title metadata.
    pub fn from_candidate(candidate: &MatchCandidate) -> Option<Self> {
        let title = candidate.title.as_deref()?;
        Some(Self::build(title, &candidate.artists, candidate.duration_ms))
    }

    fn build(title: &str, artists: &[String], duration_ms: Option<u64>) -> Self {
        let artists = normalize_artist_set(artists);
        let artists_key = artists.join(" ");
        Self {
            title: normalize_title(title),
            artists,
            artists_key,
            duration_ms,
        }
    }
}

// ============================================================================
// Duration
// ============================================================================

pub fn duration_diff_ms(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}

/// Inclusive tolerance check: a difference equal to the tolerance passes.
pub fn within_tolerance(diff_ms: u64, tolerance_ms: u64) -> bool {
    diff_ms <= tolerance_ms
}

/// Graduated duration factor for the fuzzy stage.
/// 1.0 inside the strict tolerance, decaying linearly to `MIN_DURATION_FACTOR`
/// at the fuzzy tolerance, None (reject) beyond it.
pub fn duration_factor(
    diff_ms: Option<u64>,
    tolerance_ms: u64,
    fuzzy_tolerance_ms: u64,
) -> Option<f64> {
    let diff = match diff_ms {
        None => return Some(UNKNOWN_DURATION_FACTOR),
        Some(d) => d,
    };
    if diff <= tolerance_ms {
        return Some(1.0);
    }
    if diff > fuzzy_tolerance_ms || fuzzy_tolerance_ms <= tolerance_ms {
        return None;
    }
    let span = (fuzzy_tolerance_ms - tolerance_ms) as f64;
    let over = (diff - tolerance_ms) as f64;
    Some(1.0 - (1.0 - MIN_DURATION_FACTOR) * (over / span))
}

// ============================================================================
// Similarity
// ============================================================================

/// Edit-distance similarity of two normalized titles (0.0 to 1.0).
pub fn title_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    normalized_levenshtein(a, b)
}

/// Jaccard similarity on word tokens of two normalized artist strings.
pub fn compute_artist_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }

    let tokens_a: FxHashSet<&str> = a.split_whitespace().collect();
    let tokens_b: FxHashSet<&str> = b.split_whitespace().collect();

    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();

    intersection as f64 / union as f64
}

/// Best of token overlap and edit distance over the joined artist sets.
/// Token overlap catches reordered credits, edit distance catches spelling.
pub fn artist_set_similarity(a: &NormalizedTrack, b: &NormalizedTrack) -> f64 {
    if a.artists_key.is_empty() || b.artists_key.is_empty() {
        return 0.0;
    }
    let jaccard = compute_artist_similarity(&a.artists_key, &b.artists_key);
    let edit = normalized_levenshtein(&a.artists_key, &b.artists_key);
    jaccard.max(edit)
}

// ============================================================================
// Stage Scoring
// ============================================================================

/// Exact-stage check. Returns the confidence when normalized title and artist
/// set are equal and the duration lies within tolerance.
pub fn exact_confidence(
    source: &NormalizedTrack,
    candidate: &NormalizedTrack,
    tolerance_ms: u64,
) -> Option<f64> {
    if source.title.is_empty()
        || source.title != candidate.title
        || source.artists != candidate.artists
    {
        return None;
    }
    let diff = duration_diff_ms(source.duration_ms?, candidate.duration_ms?);
    if !within_tolerance(diff, tolerance_ms) {
        return None;
    }
    let closeness = if tolerance_ms == 0 {
        1.0
    } else {
        1.0 - diff as f64 / tolerance_ms as f64
    };
    Some(EXACT_BASE_CONFIDENCE + (EXACT_MAX_CONFIDENCE - EXACT_BASE_CONFIDENCE) * closeness)
}

/// Fuzzy-stage score of one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyScore {
    /// Text similarity before the duration factor
    pub similarity: f64,
    /// Final score compared against the fuzzy threshold
    pub score: f64,
    pub duration_diff_ms: Option<u64>,
}

/// Combined fuzzy score with guardrails against false positives.
/// Returns None when the candidate is rejected regardless of threshold.
pub fn fuzzy_score(
    source: &NormalizedTrack,
    candidate: &NormalizedTrack,
    tolerance_ms: u64,
    fuzzy_tolerance_ms: u64,
) -> Option<FuzzyScore> {
    let artist_similarity = artist_set_similarity(source, candidate);
    if artist_similarity < MIN_ARTIST_SIMILARITY {
        return None;
    }

    let diff = match (source.duration_ms, candidate.duration_ms) {
        (Some(a), Some(b)) => Some(duration_diff_ms(a, b)),
        _ => None,
    };
    let factor = duration_factor(diff, tolerance_ms, fuzzy_tolerance_ms)?;

    let similarity = TITLE_WEIGHT * title_similarity(&source.title, &candidate.title)
        + (1.0 - TITLE_WEIGHT) * artist_similarity;

    Some(FuzzyScore {
        similarity,
        score: (similarity * factor).clamp(0.0, 1.0),
        duration_diff_ms: diff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(title: &str, artists: &[&str], duration_ms: Option<u64>) -> NormalizedTrack {
        let artists: Vec<String> = artists.iter().map(|a| a.to_string()).collect();
        NormalizedTrack::build(title, &artists, duration_ms)
    }

    #[test]
    fn test_within_tolerance_is_inclusive() {
        assert!(within_tolerance(2000, 2000));
        assert!(!within_tolerance(2001, 2000));
        assert!(within_tolerance(0, 0));
    }

    #[test]
    fn test_duration_factor() {
        assert_eq!(duration_factor(Some(0), 2000, 10_000), Some(1.0));
        assert_eq!(duration_factor(Some(2000), 2000, 10_000), Some(1.0));
        let edge = duration_factor(Some(10_000), 2000, 10_000).unwrap();
        assert!((edge - MIN_DURATION_FACTOR).abs() < 1e-9);
        assert_eq!(duration_factor(Some(10_001), 2000, 10_000), None);
        assert_eq!(duration_factor(None, 2000, 10_000), Some(UNKNOWN_DURATION_FACTOR));
        // A fuzzy tolerance no wider than the strict one admits nothing extra
        assert_eq!(duration_factor(Some(2001), 2000, 2000), None);
    }

    #[test]
    fn test_compute_artist_similarity() {
        assert_eq!(compute_artist_similarity("daft punk", "daft punk"), 1.0);
        assert_eq!(compute_artist_similarity("daft punk", "punk daft"), 1.0);
        assert!((compute_artist_similarity("daft punk", "daft") - 0.5).abs() < 1e-9);
        assert_eq!(compute_artist_similarity("", "daft"), 0.0);
    }

    #[test]
    fn test_exact_confidence_bounds() {
        let src = norm("Song", &["X"], Some(200_000));
        let same = norm("Song (Remastered)", &["x"], Some(200_000));
        let edge = norm("Song", &["X"], Some(202_000));
        let over = norm("Song", &["X"], Some(202_001));

        assert_eq!(exact_confidence(&src, &same, 2000), Some(EXACT_MAX_CONFIDENCE));
        let c = exact_confidence(&src, &edge, 2000).unwrap();
        assert!((c - EXACT_BASE_CONFIDENCE).abs() < 1e-9);
        assert_eq!(exact_confidence(&src, &over, 2000), None);
    }

    #[test]
    fn test_exact_requires_same_artist_set() {
        let src = norm("Song", &["X", "Y"], Some(200_000));
        let fewer = norm("Song", &["X"], Some(200_000));
        let reordered = norm("Song", &["Y", "X"], Some(200_000));
        assert_eq!(exact_confidence(&src, &fewer, 2000), None);
        assert!(exact_confidence(&src, &reordered, 2000).is_some());
    }

    #[test]
    fn test_exact_requires_candidate_duration() {
        let src = norm("Song", &["X"], Some(200_000));
        let unknown = norm("Song", &["X"], None);
        assert_eq!(exact_confidence(&src, &unknown, 2000), None);
    }

    #[test]
    fn test_fuzzy_score_rejects_other_artist() {
        let src = norm("Yesterday", &["The Beatles"], Some(125_000));
        let cover = norm("Yesterday", &["Boyz II Men"], Some(125_000));
        assert!(fuzzy_score(&src, &cover, 2000, 10_000).is_none());
    }

    #[test]
    fn test_fuzzy_score_typo() {
        let src = norm("Bohemian Rhapsody", &["Queen"], Some(354_000));
        let typo = norm("Bohemian Rapsody", &["Queen"], Some(355_000));
        let s = fuzzy_score(&src, &typo, 2000, 10_000).unwrap();
        assert!(s.score > 0.9, "score was {}", s.score);
        assert_eq!(s.duration_diff_ms, Some(1000));
    }

    #[test]
    fn test_fuzzy_score_just_over_tolerance() {
        let src = norm("Song", &["X"], Some(200_000));
        let cand = norm("Song", &["X"], Some(202_001));
        let s = fuzzy_score(&src, &cand, 2000, 10_000).unwrap();
        assert_eq!(s.similarity, 1.0);
        assert!(s.score > 0.99 && s.score < 1.0);
    }
}
