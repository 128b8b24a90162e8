//! Normalization functions shared by matching and fingerprinting.
//!
//! CRITICAL: canonical keys feed the snapshot hash. Any change here changes the
//! identity of every existing job, so previously written checkpoints stop
//! being found. Run tests after changes.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::models::TrackDescriptor;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Any bracketed span without nested brackets: "(Remastered)", "[Live]", "{Demo}".
/// Applied repeatedly so nested qualifiers collapse from the inside out.
pub static BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[\{][^\(\)\[\]\{\}]*[\)\]\}]\s*").unwrap());

/// Featured artists without brackets: "Song feat. Artist", "Song ft. Someone"
pub static FEAT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:feat\.?|ft\.|featuring)\s+.+$").unwrap());

/// Dash-separated qualifiers at the end of a title (applied in order).
pub static DASH_QUALIFIERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Remaster variants: "- Remastered 2021", "- 2009 Remaster", "/ 2001 Digital Remaster"
        Regex::new(r"(?i)\s+[-–—/]\s+(?:\d{4}\s+)?(?:digital\s+)?remaster(?:ed)?(?:\s+(?:version|\d{4}))?\s*$").unwrap(),
        // Live/acoustic: "- Live at Wembley", "- Acoustic Version"
        Regex::new(r"(?i)\s+[-–—]\s+(?:live(?:\s+(?:at|from|in)\s+.+)?|acoustic(?:\s+version)?)\s*$").unwrap(),
        // Mix/version variants: "- Radio Edit", "- Single Version", "- Mono"
        Regex::new(r"(?i)\s+[-–—]\s+(?:radio\s+edit|(?:single|album|lp)\s+version|mono|stereo)\s*$").unwrap(),
        // Year suffix: "- 2021", "- 1997 Version"
        Regex::new(r"(?i)\s+[-–—]\s+\d{4}(?:\s+(?:version|mix|edit))?\s*$").unwrap(),
    ]
});

/// Featured artists inside an artist credit: "Artist feat. Other"
pub static ARTIST_FEAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+.*$").unwrap());

/// Anything that is not a lowercase ASCII letter or digit, after folding.
pub static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(
        c as u32,
        0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F
    )
}

/// Fold Unicode text to lowercase ASCII by applying NFKD decomposition,
/// removing combining marks and transliterating what is left.
/// e.g., "Beyoncé" → "beyonce", "Кино" → "kino"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_lowercase()
}

/// Straighten curly quotes and spell out ampersands.
pub fn normalize_punctuation(s: &str) -> String {
    s.replace(['\u{2018}', '\u{2019}', '\u{00B4}', '\u{0060}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('&', " and ")
}

/// Drop apostrophes, turn every other punctuation run into a space and
/// collapse whitespace. Input must already be folded.
fn collapse_punctuation(folded: &str) -> String {
    let without_apostrophes = folded.replace('\'', "");
    NON_ALNUM
        .replace_all(&without_apostrophes, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_bracketed(s: &str) -> String {
    let mut current = s.to_string();
    loop {
        let next = BRACKETED.replace_all(&current, " ").to_string();
        if next == current {
            return next;
        }
        current = next;
    }
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Normalize a title for matching.
/// Strips bracketed qualifiers, "feat." annotations and remaster/live suffixes,
/// folds case and diacritics, collapses punctuation and whitespace.
pub fn normalize_title(title: &str) -> String {
    let mut result = normalize_punctuation(title);

    result = FEAT_SUFFIX.replace(&result, "").to_string();
    for pattern in DASH_QUALIFIERS.iter() {
        result = pattern.replace(&result, "").to_string();
    }

    let stripped = strip_bracketed(&result);
    let normalized = collapse_punctuation(&fold_to_ascii(&stripped));
    if normalized.is_empty() {
        // Fully bracketed titles like "[Untitled]" keep their content
        return collapse_punctuation(&fold_to_ascii(&result));
    }
    normalized
}

/// Normalize one artist credit.
/// Strips featured artists and a leading "the".
pub fn normalize_artist(artist: &str) -> String {
    let mut result = normalize_punctuation(artist);
    result = ARTIST_FEAT.replace(&result, "").to_string();

    let normalized = collapse_punctuation(&fold_to_ascii(&result));
    match normalized.strip_prefix("the ") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => normalized,
    }
}

/// Normalized, sorted, deduplicated artist set.
pub fn normalize_artist_set(artists: &[String]) -> Vec<String> {
    let mut set: Vec<String> = artists
        .iter()
        .map(|a| normalize_artist(a))
        .filter(|a| !a.is_empty())
        .collect();
    set.sort();
    set.dedup();
    set
}

/// Artist set joined into a single comparable string.
pub fn artists_key(artists: &[String]) -> String {
    normalize_artist_set(artists).join(" ")
}

/// Round a duration to the nearest bucket (half rounds up).
pub fn duration_bucket(duration_ms: u64, bucket_ms: u64) -> u64 {
    let bucket = bucket_ms.max(1);
    (duration_ms + bucket / 2) / bucket * bucket
}

/// Canonical key of a track for fingerprinting.
/// `isrc:<ISRC>` when an ISRC is present, otherwise title, artist set and
/// duration bucket.
pub fn canonical_key(track: &TrackDescriptor, bucket_ms: u64) -> String {
    if let Some(isrc) = track.isrc_normalized() {
        return format!("isrc:{}", isrc);
    }
    format!(
        "meta:{}::{}::{}",
        normalize_title(&track.title),
        artists_key(&track.artists),
        duration_bucket(track.duration_ms, bucket_ms)
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_title_basic() {
        assert_eq!(normalize_title("Song (Remastered)"), "song");
        assert_eq!(normalize_title("Song [Mono]"), "song");
        assert_eq!(normalize_title("Track (2021 Remaster)"), "track");
        assert_eq!(normalize_title("  Hello,   World!  "), "hello world");
    }

    #[test]
    fn test_normalize_title_dash_qualifiers() {
        assert_eq!(normalize_title("Song - 2001 Digital Remaster"), "song");
        assert_eq!(normalize_title("Song - Remastered 2011"), "song");
        assert_eq!(normalize_title("Hit - Single Version"), "hit");
        assert_eq!(normalize_title("Song - Live at Wembley"), "song");
        assert_eq!(normalize_title("Song - 1997 Version"), "song");
        // A hyphen inside the title is not a qualifier
        assert_eq!(normalize_title("Anti-Hero"), "anti hero");
    }

    #[test]
    fn test_normalize_title_feat() {
        assert_eq!(normalize_title("Song (feat. Someone)"), "song");
        assert_eq!(normalize_title("Song [ft. Someone Else]"), "song");
        assert_eq!(normalize_title("Song feat. Someone"), "song");
        assert_eq!(normalize_title("Song featuring Someone"), "song");
    }

    #[test]
    fn test_normalize_title_nested_and_bare_brackets() {
        assert_eq!(normalize_title("Song (Live (2019 Remaster))"), "song");
        assert_eq!(normalize_title("(I Can't Get No) Satisfaction"), "satisfaction");
        assert_eq!(normalize_title("[Untitled]"), "untitled");
    }

    #[test]
    fn test_normalize_title_punctuation() {
        assert_eq!(normalize_title("Don’t Stop Me Now"), "dont stop me now");
        assert_eq!(normalize_title("Rock & Roll"), "rock and roll");
        assert_eq!(normalize_title("Mr. Brightside"), "mr brightside");
    }

    #[test]
    fn test_normalize_artist_basic() {
        assert_eq!(normalize_artist("The Beatles"), "beatles");
        assert_eq!(normalize_artist("Artist feat. Other"), "artist");
        assert_eq!(normalize_artist("Simon & Garfunkel"), "simon and garfunkel");
        assert_eq!(normalize_artist("The The"), "the");
        assert_eq!(normalize_artist("AC/DC"), "ac dc");
    }

    #[test]
    fn test_fold_to_ascii() {
        assert_eq!(fold_to_ascii("Björk"), "bjork");
        assert_eq!(fold_to_ascii("Motörhead"), "motorhead");
        assert_eq!(fold_to_ascii("Beyoncé"), "beyonce");
        assert_eq!(fold_to_ascii("Кино"), "kino");
    }

    #[test]
    fn test_artist_set_is_order_independent() {
        let a = normalize_artist_set(&strings(&["Zedd", "Alessia Cara"]));
        let b = normalize_artist_set(&strings(&["alessia cara", "ZEDD", "Zedd"]));
        assert_eq!(a, b);
        assert_eq!(artists_key(&strings(&["Zedd", "Alessia Cara"])), "alessia cara zedd");
        assert!(normalize_artist_set(&strings(&["", "  "])).is_empty());
    }

    #[test]
    fn test_duration_bucket() {
        assert_eq!(duration_bucket(200_000, 2000), 200_000);
        assert_eq!(duration_bucket(199_200, 2000), 200_000);
        assert_eq!(duration_bucket(198_999, 2000), 198_000);
        assert_eq!(duration_bucket(199_000, 2000), 200_000);
        assert_eq!(duration_bucket(0, 2000), 0);
        assert_eq!(duration_bucket(1234, 0), 1234);
    }

    #[test]
    fn test_canonical_key() {
        let mut track = TrackDescriptor {
            source_id: "1".to_string(),
            title: "Song (Remastered)".to_string(),
            artists: strings(&["X"]),
            duration_ms: 200_000,
            isrc: None,
            album: None,
        };
        assert_eq!(canonical_key(&track, 2000), "meta:song::x::200000");

        track.isrc = Some("usum71703861".to_string());
        assert_eq!(canonical_key(&track, 2000), "isrc:USUM71703861");
    }
}
