//! Matching Engine: resolves source tracks to target catalog identifiers.
//!
//! Three stages run in order and the first confident hit wins:
//! 1. ISRC: a candidate carrying the same ISRC (confidence 1.0)
//! 2. Exact: equal normalized title and artist set, duration within tolerance
//! 3. Fuzzy: edit-distance similarity combined with a duration factor
//!
//! Within a stage, a candidate on the source's album beats one that is not
//! before duration closeness is considered.
//!
//! Classification is a pure function of a track and its candidates; the
//! engine adds the candidate search (with retries) and bounded parallelism.

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, Clock};
use crate::config::TransferConfig;
use crate::deadline::call_with_deadline;
use crate::error::{ConfigError, ErrorClass, RetryKind, TransferError};
use crate::models::{
    normalize_isrc, MatchCandidate, MatchResult, MatchStage, MatchStatus, TrackDescriptor,
};
use crate::normalize::normalize_title;
use crate::ports::TargetSearch;
use crate::progress::{create_progress_bar, log_progress};
use crate::scoring::{exact_confidence, fuzzy_score, NormalizedTrack};

const SIMILARITY_EPSILON: f64 = 1e-9;

// ============================================================================
// Classification
// ============================================================================

/// Thresholds that drive classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    pub fuzzy_threshold: f64,
    pub duration_tolerance_ms: u64,
    pub fuzzy_duration_tolerance_ms: u64,
    pub ambiguity_margin: f64,
    pub top_k: usize,
}

impl MatchThresholds {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            fuzzy_threshold: config.fuzzy_threshold,
            duration_tolerance_ms: config.duration_tolerance_ms,
            fuzzy_duration_tolerance_ms: config.fuzzy_duration_tolerance_ms,
            ambiguity_margin: config.ambiguity_margin,
            top_k: config.top_k,
        }
    }
}

/// Per-candidate evaluation across all stages.
#[derive(Debug, Clone)]
struct Evaluated {
    index: usize,
    isrc_match: bool,
    album_match: bool,
    exact: Option<f64>,
    fuzzy: Option<FuzzyEval>,
}

#[derive(Debug, Clone, Copy)]
struct FuzzyEval {
    similarity: f64,
    score: f64,
    duration_diff_ms: Option<u64>,
}

impl Evaluated {
    fn confidence(&self) -> f64 {
        if self.isrc_match {
            return 1.0;
        }
        self.exact
            .or(self.fuzzy.map(|f| f.score))
            .unwrap_or(0.0)
    }
}

/// Album titles compare like track titles; an empty album never matches.
fn album_key(album: Option<&str>) -> Option<String> {
    album.map(normalize_title).filter(|a| !a.is_empty())
}

fn evaluate(
    track: &TrackDescriptor,
    candidates: &[MatchCandidate],
    t: &MatchThresholds,
) -> Vec<Evaluated> {
    let source_isrc = track.isrc_normalized();
    let source_album = album_key(track.album.as_deref());
    let source = NormalizedTrack::from_descriptor(track);

    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            let isrc_match = match (&source_isrc, normalize_isrc(candidate.isrc.as_deref())) {
                (Some(a), Some(b)) => *a == b,
                _ => false,
            };
            let album_match =
                source_album.is_some() && album_key(candidate.album.as_deref()) == source_album;
            let (exact, fuzzy) = match NormalizedTrack::from_candidate(candidate) {
                Some(norm) => (
                    exact_confidence(&source, &norm, t.duration_tolerance_ms),
                    fuzzy_score(
                        &source,
                        &norm,
                        t.duration_tolerance_ms,
                        t.fuzzy_duration_tolerance_ms,
                    )
                    .map(|f| FuzzyEval {
                        similarity: f.similarity,
                        score: f.score,
                        duration_diff_ms: f.duration_diff_ms,
                    }),
                ),
                // Without metadata only the provider's own confidence is available
                None => {
                    let c = candidate.confidence.clamp(0.0, 1.0);
                    (
                        None,
                        Some(FuzzyEval {
                            similarity: c,
                            score: c,
                            duration_diff_ms: None,
                        }),
                    )
                }
            };
            Evaluated {
                index,
                isrc_match,
                album_match,
                exact,
                fuzzy,
            }
        })
        .collect()
}

fn ranked_candidates(
    candidates: &[MatchCandidate],
    evaluated: &[Evaluated],
    top_k: usize,
) -> Vec<MatchCandidate> {
    let mut ranked: Vec<&Evaluated> = evaluated.iter().collect();
    // Stable sort keeps provider order among equal confidences
    ranked.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
    ranked
        .into_iter()
        .take(top_k)
        .map(|e| {
            let mut c = candidates[e.index].clone();
            c.confidence = e.confidence();
            c
        })
        .collect()
}

fn matched(
    track: &TrackDescriptor,
    candidate: &MatchCandidate,
    stage: MatchStage,
    confidence: f64,
    reason: String,
    top_candidates: Vec<MatchCandidate>,
) -> MatchResult {
    let mut chosen = candidate.clone();
    chosen.confidence = confidence;
    MatchResult {
        source_track: track.clone(),
        chosen: Some(chosen),
        stage: Some(stage),
        confidence,
        status: MatchStatus::Matched,
        reason,
        top_candidates,
    }
}

fn unresolved(
    track: &TrackDescriptor,
    status: MatchStatus,
    confidence: f64,
    reason: String,
    top_candidates: Vec<MatchCandidate>,
) -> MatchResult {
    MatchResult {
        source_track: track.clone(),
        chosen: None,
        stage: None,
        confidence,
        status,
        reason,
        top_candidates,
    }
}

/// Classifies one track against the candidates its search returned.
pub fn classify(
    track: &TrackDescriptor,
    candidates: &[MatchCandidate],
    t: &MatchThresholds,
) -> MatchResult {
    if candidates.is_empty() {
        let reason = "no candidates returned".to_string();
        return unresolved(track, MatchStatus::NotFound, 0.0, reason, vec![]);
    }

    let evaluated = evaluate(track, candidates, t);
    let top = ranked_candidates(candidates, &evaluated, t.top_k);

    // Stage 1: ISRC
    if let Some(e) = evaluated.iter().find(|e| e.isrc_match) {
        let reason = "isrc match".to_string();
        return matched(track, &candidates[e.index], MatchStage::Isrc, 1.0, reason, top);
    }

    // Stage 2: exact. Album first, then highest confidence (closest
    // duration); first wins ties.
    let mut best_exact: Option<(&Evaluated, f64)> = None;
    for e in &evaluated {
        if let Some(c) = e.exact {
            let better = best_exact.map_or(true, |(b, best)| {
                e.album_match.cmp(&b.album_match).then(c.total_cmp(&best)).is_gt()
            });
            if better {
                best_exact = Some((e, c));
            }
        }
    }
    if let Some((e, confidence)) = best_exact {
        return matched(
            track,
            &candidates[e.index],
            MatchStage::Exact,
            confidence,
            "exact title/artist/duration match".to_string(),
            top,
        );
    }

    // Stage 3: fuzzy
    let mut accepted: Vec<(&Evaluated, FuzzyEval)> = evaluated
        .iter()
        .filter_map(|e| e.fuzzy.map(|f| (e, f)))
        .filter(|(_, f)| f.score >= t.fuzzy_threshold)
        .collect();

    if accepted.is_empty() {
        let best = evaluated.iter().map(Evaluated::confidence).fold(0.0, f64::max);
        return unresolved(
            track,
            MatchStatus::NotFound,
            best,
            format!(
                "no candidate reached fuzzy threshold {:.2} (best {:.3})",
                t.fuzzy_threshold, best
            ),
            top,
        );
    }

    // Best score first, provider order on ties
    accepted.sort_by(|(a, fa), (b, fb)| {
        fb.score
            .total_cmp(&fa.score)
            .then(a.index.cmp(&b.index))
    });
    let best_score = accepted[0].1.score;
    let mut contenders: Vec<(&Evaluated, FuzzyEval)> = accepted
        .into_iter()
        .filter(|(_, f)| best_score - f.score <= t.ambiguity_margin + SIMILARITY_EPSILON)
        .collect();
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    contenders.retain(|(e, _)| seen.insert(candidates[e.index].target_id.as_str()));

    if contenders.len() > 1 {
        // Highest similarity first, then same album, then closest duration
        contenders.sort_by(|(a, fa), (b, fb)| {
            fb.similarity
                .total_cmp(&fa.similarity)
                .then(b.album_match.cmp(&a.album_match))
                .then(diff_key(fa).cmp(&diff_key(fb)))
                .then(a.index.cmp(&b.index))
        });
        let ((ea, first), (eb, second)) = (contenders[0], contenders[1]);
        let preferred = first.similarity - second.similarity > SIMILARITY_EPSILON
            || ea
                .album_match
                .cmp(&eb.album_match)
                .then(diff_key(&second).cmp(&diff_key(&first)))
                .is_gt();
        if !preferred {
            return unresolved(
                track,
                MatchStatus::Ambiguous,
                best_score,
                format!(
                    "{} candidates within {:.2} of best score {:.3}",
                    contenders.len(),
                    t.ambiguity_margin,
                    best_score
                ),
                top,
            );
        }
    }

    let (e, f) = contenders[0];
    matched(
        track,
        &candidates[e.index],
        MatchStage::Fuzzy,
        f.score,
        format!("fuzzy match score {:.3}", f.score),
        top,
    )
}

/// Unknown durations sort after every known one.
fn diff_key(f: &FuzzyEval) -> u64 {
    f.duration_diff_ms.unwrap_or(u64::MAX)
}

// ============================================================================
// Engine
// ============================================================================

/// Match result plus the retry cost of producing it.
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub result: MatchResult,
    pub retries: u32,
    pub rl_wait_ms: u64,
}

pub struct MatchingEngine {
    search: Arc<dyn TargetSearch>,
    clock: Arc<dyn Clock>,
    thresholds: MatchThresholds,
    workers: usize,
    max_retries: u32,
    max_rate_limit_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    jitter_seed: Option<u64>,
    deadline: Option<Duration>,
}

impl MatchingEngine {
    pub fn new(
        search: Arc<dyn TargetSearch>,
        clock: Arc<dyn Clock>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            search,
            clock,
            thresholds: MatchThresholds::from_config(config),
            workers: config.match_workers,
            max_retries: config.max_retries,
            max_rate_limit_retries: config.max_rate_limit_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            jitter_seed: config.jitter_seed,
            deadline: config.operation_deadline(),
        }
    }

    /// Searches and classifies one track. Only fatal search failures are
    /// returned as errors; every other failure becomes a `not_found` result.
    pub fn match_track(
        &self,
        track: &TrackDescriptor,
        ordinal: u64,
    ) -> Result<TrackMatch, TransferError> {
        if let Some(reason) = track.validation_error() {
            return Ok(TrackMatch {
                result: unresolved(track, MatchStatus::NotFound, 0.0, reason, vec![]),
                retries: 0,
                rl_wait_ms: 0,
            });
        }

        let mut backoff = Backoff::new(
            self.backoff_base,
            self.backoff_max,
            self.jitter_seed.map(|s| s.wrapping_add(ordinal)),
        );
        let mut retries = 0u32;
        let mut rate_limited = 0u32;
        let mut rl_wait_ms = 0u64;

        loop {
            let search = Arc::clone(&self.search);
            let request = track.clone();
            let top_k = self.thresholds.top_k;
            let outcome =
                call_with_deadline(self.deadline, move || search.find_candidates(&request, top_k));

            let err = match outcome {
                Ok(candidates) => {
                    let result = classify(track, &candidates, &self.thresholds);
                    debug!(
                        track = %track.source_id,
                        status = ?result.status,
                        stage = ?result.stage,
                        confidence = result.confidence,
                        "classified"
                    );
                    return Ok(TrackMatch {
                        result,
                        retries,
                        rl_wait_ms,
                    });
                }
                Err(err) => err,
            };

            let give_up = move |reason: String| TrackMatch {
                result: unresolved(track, MatchStatus::NotFound, 0.0, reason, vec![]),
                retries,
                rl_wait_ms,
            };

            match err.class() {
                ErrorClass::Fatal => return Err(TransferError::from_fatal(&err)),
                ErrorClass::Recorded => return Ok(give_up(format!("search failed: {}", err))),
                ErrorClass::Retriable(RetryKind::RateLimit(delay)) => {
                    rate_limited += 1;
                    if rate_limited > self.max_rate_limit_retries {
                        warn!(track = %track.source_id, "search still rate limited, giving up");
                        let reason =
                            format!("search rate limited after {} retries", rate_limited - 1);
                        return Ok(give_up(reason));
                    }
                    self.clock.sleep(delay);
                    rl_wait_ms += delay.as_millis() as u64;
                }
                ErrorClass::Retriable(RetryKind::Transient) => {
                    if backoff.attempt() >= self.max_retries {
                        warn!(track = %track.source_id, error = %err, "search retries exhausted");
                        let reason = format!(
                            "search failed after {} retries: {}",
                            backoff.attempt(),
                            err
                        );
                        return Ok(give_up(reason));
                    }
                    let delay = backoff.next_delay();
                    debug!(
                        track = %track.source_id,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "search retry"
                    );
                    self.clock.sleep(delay);
                }
            }
            retries += 1;
        }
    }

    /// Matches every track with at most `match_workers` concurrent searches.
    /// Output order equals input order.
    pub fn match_all(
        &self,
        tracks: &[TrackDescriptor],
        show_progress: bool,
    ) -> Result<Vec<TrackMatch>, TransferError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.max(1))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("cannot start matching workers: {}", e)))?;

        let total = tracks.len() as u64;
        let pb = create_progress_bar(total, "Matching tracks", show_progress);
        let done = AtomicU64::new(0);

        let results: Result<Vec<TrackMatch>, TransferError> = pool.install(|| {
            tracks
                .par_iter()
                .enumerate()
                .map(|(i, track)| {
                    let m = self.match_track(track, i as u64);
                    pb.inc(1);
                    let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                    log_progress("matching", current, total, 100, show_progress);
                    m
                })
                .collect()
        });

        let results = results?;
        let matched = results.iter().filter(|m| m.result.is_matched()).count();
        pb.finish_with_message(format!("Matched {}/{} tracks", matched, total));
        info!(tracks = total, matched, "matching complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::test_support::{candidate, engine_config, track, track_isrc, FakeClock, FakeTarget};

    fn thresholds() -> MatchThresholds {
        MatchThresholds::from_config(&TransferConfig::default())
    }

    fn bare(target_id: &str, confidence: f64) -> MatchCandidate {
        MatchCandidate {
            target_id: target_id.to_string(),
            confidence,
            reason: "search".to_string(),
            title: None,
            artists: vec![],
            duration_ms: None,
            isrc: None,
            album: None,
        }
    }

    #[test]
    fn test_isrc_takes_precedence() {
        let src = track_isrc("s1", "Song", &["X"], 200_000, "usaaa0000001");
        let exact = candidate("t-exact", "Song", &["X"], 200_000);
        let mut by_isrc = candidate("t-isrc", "Totally Different", &["Nobody"], 10_000);
        by_isrc.isrc = Some("USAAA0000001".to_string());

        let r = classify(&src, &[exact, by_isrc], &thresholds());
        assert_eq!(r.status, MatchStatus::Matched);
        assert_eq!(r.stage, Some(MatchStage::Isrc));
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.target_id(), Some("t-isrc"));
        assert_eq!(r.top_candidates[0].target_id, "t-isrc");
    }

    #[test]
    fn test_exact_stage_boundary() {
        let src = track("s1", "Song", &["X"], 200_000);

        let at_edge = classify(&src, &[candidate("t1", "Song", &["X"], 202_000)], &thresholds());
        assert_eq!(at_edge.stage, Some(MatchStage::Exact));
        assert!(at_edge.confidence >= 0.95);

        let over = classify(&src, &[candidate("t1", "Song", &["X"], 202_001)], &thresholds());
        assert_eq!(over.status, MatchStatus::Matched);
        assert_eq!(over.stage, Some(MatchStage::Fuzzy));

        let below = classify(&src, &[candidate("t1", "Song", &["X"], 197_999)], &thresholds());
        assert_eq!(below.stage, Some(MatchStage::Fuzzy));
    }

    #[test]
    fn test_exact_prefers_closest_duration() {
        let src = track("s1", "Song", &["X"], 200_000);
        let far = candidate("far", "Song", &["X"], 201_500);
        let near = candidate("near", "Song (Remastered)", &["X"], 200_100);
        let r = classify(&src, &[far, near], &thresholds());
        assert_eq!(r.stage, Some(MatchStage::Exact));
        assert_eq!(r.target_id(), Some("near"));
    }

    #[test]
    fn test_fuzzy_accepts_typo() {
        let src = track("s1", "Bohemian Rhapsody", &["Queen"], 354_000);
        let typo = candidate("t1", "Bohemian Rapsody", &["Queen"], 354_500);
        let r = classify(&src, &[typo], &thresholds());
        assert_eq!(r.stage, Some(MatchStage::Fuzzy));
        assert!(r.confidence >= 0.85 && r.confidence < 1.0);
    }

    #[test]
    fn test_fuzzy_respects_threshold() {
        let src = track("s1", "Bohemian Rhapsody", &["Queen"], 354_000);
        let cand = candidate("t1", "Bohemian Rapsody", &["Queen"], 354_500);
        let strict = MatchThresholds {
            fuzzy_threshold: 0.99,
            ..thresholds()
        };
        let r = classify(&src, &[cand], &strict);
        assert_eq!(r.status, MatchStatus::NotFound);
        assert_eq!(r.stage, None);
        assert_eq!(r.top_candidates.len(), 1);
        assert!(r.top_candidates[0].confidence > 0.85);
    }

    #[test]
    fn test_not_found_keeps_top_k() {
        let src = track("s1", "Yesterday", &["The Beatles"], 125_000);
        let cands = vec![
            candidate("a", "Yesterday", &["Boyz II Men"], 125_000),
            candidate("b", "Let It Be", &["Beatles"], 243_000),
            candidate("c", "Hey Jude", &["Beatles"], 431_000),
            candidate("d", "Help", &["Beatles"], 138_000),
        ];
        let r = classify(&src, &cands, &thresholds());
        assert_eq!(r.status, MatchStatus::NotFound);
        assert!(r.chosen.is_none());
        assert_eq!(r.top_candidates.len(), 3);
    }

    #[test]
    fn test_no_candidates() {
        let r = classify(&track("s1", "Song", &["X"], 1000), &[], &thresholds());
        assert_eq!(r.status, MatchStatus::NotFound);
        assert!(r.top_candidates.is_empty());
    }

    #[test]
    fn test_ambiguous_when_indistinguishable() {
        let src = track("s1", "Song", &["X"], 200_000);
        // Both just outside exact tolerance, same distance, same text
        let a = candidate("a", "Song!", &["X"], 203_000);
        let b = candidate("b", "Song?", &["X"], 197_000);
        let r = classify(&src, &[a, b], &thresholds());
        assert_eq!(r.status, MatchStatus::Ambiguous);
        assert!(r.chosen.is_none());
        assert_eq!(r.top_candidates.len(), 2);
    }

    #[test]
    fn test_tie_broken_by_duration() {
        let src = track("s1", "Song", &["X"], 200_000);
        let a = candidate("a", "Song", &["X"], 203_500);
        let b = candidate("b", "Song", &["X"], 203_000);
        let r = classify(&src, &[a, b], &thresholds());
        assert_eq!(r.status, MatchStatus::Matched);
        assert_eq!(r.target_id(), Some("b"));
    }

    #[test]
    fn test_exact_prefers_source_album_over_duration() {
        let mut src = track("s1", "Song", &["X"], 200_000);
        src.album = Some("First Album".to_string());
        let mut compilation = candidate("comp", "Song", &["X"], 200_000);
        compilation.album = Some("Greatest Hits".to_string());
        let mut original = candidate("orig", "Song", &["X"], 201_200);
        original.album = Some("First Album (Deluxe Edition)".to_string());

        let r = classify(&src, &[compilation.clone(), original.clone()], &thresholds());
        assert_eq!(r.stage, Some(MatchStage::Exact));
        assert_eq!(r.target_id(), Some("orig"));

        // Without a source album duration decides
        src.album = None;
        let r = classify(&src, &[compilation, original], &thresholds());
        assert_eq!(r.target_id(), Some("comp"));
    }

    #[test]
    fn test_album_breaks_fuzzy_tie() {
        let mut src = track("s1", "Song", &["X"], 200_000);
        src.album = Some("Blue".to_string());
        let mut a = candidate("a", "Song!", &["X"], 203_000);
        a.album = Some("Red".to_string());
        let mut b = candidate("b", "Song?", &["X"], 197_000);
        b.album = Some("blue".to_string());

        let r = classify(&src, &[a, b], &thresholds());
        assert_eq!(r.status, MatchStatus::Matched);
        assert_eq!(r.stage, Some(MatchStage::Fuzzy));
        assert_eq!(r.target_id(), Some("b"));
    }

    #[test]
    fn test_candidate_without_metadata_uses_provider_confidence() {
        let src = track("s1", "Song", &["X"], 200_000);
        let r = classify(&src, &[bare("t1", 0.9)], &thresholds());
        assert_eq!(r.stage, Some(MatchStage::Fuzzy));
        assert_eq!(r.confidence, 0.9);

        let low = classify(&src, &[bare("t1", 0.5)], &thresholds());
        assert_eq!(low.status, MatchStatus::NotFound);
    }

    #[test]
    fn test_match_track_retries_transient_search() {
        let target = Arc::new(FakeTarget::new("tgt"));
        let src = track("s1", "Song", &["X"], 200_000);
        target.set_results("s1", vec![candidate("t1", "Song", &["X"], 200_000)]);
        target.fail_searches(vec![Some(ProviderError::Temporary("503".into()))]);
        let clock = Arc::new(FakeClock::new());

        let engine = MatchingEngine::new(target.clone(), clock.clone(), &engine_config());
        let m = engine.match_track(&src, 0).unwrap();
        assert!(m.result.is_matched());
        assert_eq!(m.retries, 1);
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn test_match_track_rate_limit_then_gives_up() {
        let target = Arc::new(FakeTarget::new("tgt"));
        let rl = || Some(ProviderError::RateLimited { retry_after_ms: 1000 });
        target.fail_searches(vec![rl(), rl(), rl(), rl()]);
        let clock = Arc::new(FakeClock::new());

        let engine = MatchingEngine::new(target.clone(), clock.clone(), &engine_config());
        let m = engine.match_track(&track("s1", "Song", &["X"], 200_000), 0).unwrap();
        assert_eq!(m.result.status, MatchStatus::NotFound);
        assert!(m.result.reason.contains("rate limited"));
        assert_eq!(m.rl_wait_ms, 3000);
        assert_eq!(clock.total_slept_ms(), 3000);
    }

    #[test]
    fn test_match_track_authorization_is_fatal() {
        let target = Arc::new(FakeTarget::new("tgt"));
        target.fail_searches(vec![Some(ProviderError::Authorization("expired".into()))]);
        let engine = MatchingEngine::new(target, Arc::new(FakeClock::new()), &engine_config());
        let err = engine.match_track(&track("s1", "Song", &["X"], 200_000), 0).unwrap_err();
        assert!(matches!(err, TransferError::Authorization(_)));
    }

    #[test]
    fn test_match_track_invalid_skips_search() {
        let target = Arc::new(FakeTarget::new("tgt"));
        let engine =
            MatchingEngine::new(target.clone(), Arc::new(FakeClock::new()), &engine_config());
        let m = engine.match_track(&track("s1", "Song", &[], 200_000), 0).unwrap();
        assert_eq!(m.result.status, MatchStatus::NotFound);
        assert_eq!(target.search_calls(), 0);
    }

    #[test]
    fn test_match_all_preserves_order() {
        let target = Arc::new(FakeTarget::new("tgt"));
        let tracks: Vec<TrackDescriptor> = (0..20)
            .map(|i| track(&format!("s{i}"), &format!("Song {i}"), &["X"], 200_000))
            .collect();
        for t in &tracks {
            let hit = candidate(&format!("t-{}", t.source_id), &t.title, &["X"], 200_000);
            target.set_results(&t.source_id, vec![hit]);
        }
        let engine = MatchingEngine::new(target, Arc::new(FakeClock::new()), &engine_config());
        let results = engine.match_all(&tracks, false).unwrap();
        assert_eq!(results.len(), 20);
        for (t, m) in tracks.iter().zip(&results) {
            assert_eq!(m.result.source_track.source_id, t.source_id);
            assert_eq!(m.result.target_id(), Some(format!("t-{}", t.source_id).as_str()));
        }
    }
}
