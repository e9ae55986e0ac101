//! Fuzzy phrase matching for spoken commands
//!
//! Transcripts and command patterns are normalized the same way, then scored
//! 0-100 with exact, containment and word-overlap heuristics. Spoken Spanish
//! comes back from recognizers with inconsistent accents and punctuation, so
//! both are folded away before any comparison.

/// Characters dropped during normalization
const PUNCTUATION: [char; 8] = ['.', ',', ';', ':', '!', '?', '¿', '¡'];

/// Score for identical normalized strings
pub const EXACT_SCORE: f64 = 100.0;

const CONTAINMENT_WEIGHT: f64 = 95.0;
const WORD_OVERLAP_WEIGHT: f64 = 80.0;
const EMBEDDED_WEIGHT: f64 = 100.0;

/// Words this short never count towards word overlap
const MIN_WORD_LEN: usize = 3;

/// Canonical form used for every comparison: lowercase, no Spanish accents,
/// no sentence punctuation, single spaces, no leading/trailing whitespace
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !PUNCTUATION.contains(c))
        .map(fold_accent)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_accent(c: char) -> char {
    match c {
        'á' => 'a',
        'é' => 'e',
        'í' => 'i',
        'ó' => 'o',
        'ú' | 'ü' => 'u',
        'ñ' => 'n',
        other => other,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Similarity of two phrases in [0, 100], normalizing both first
pub fn similarity(a: &str, b: &str) -> f64 {
    similarity_normalized(&normalize(a), &normalize(b))
}

/// Similarity of two already-normalized phrases
///
/// Precedence: exact match (100), containment of one in the other
/// (`shorter / longer * 95`), then word overlap
/// (`matched / max(words_a, words_b) * 80`).
pub fn similarity_normalized(a: &str, b: &str) -> f64 {
    if a == b {
        return EXACT_SCORE;
    }

    if a.contains(b) || b.contains(a) {
        let (len_a, len_b) = (char_len(a), char_len(b));
        let longer = len_a.max(len_b);
        if longer == 0 {
            return 0.0;
        }
        return (len_a.min(len_b) as f64 / longer as f64) * CONTAINMENT_WEIGHT;
    }

    word_overlap(a, b)
}

/// Fraction of `a`'s words (longer than two chars) that share a substring
/// relation with some word of `b`, weighted to 80
fn word_overlap(a: &str, b: &str) -> f64 {
    let words_a: Vec<&str> = a.split_whitespace().collect();
    let words_b: Vec<&str> = b.split_whitespace().collect();
    let total = words_a.len().max(words_b.len());
    if total == 0 {
        return 0.0;
    }

    let matched = words_a
        .iter()
        .filter(|w| char_len(w) >= MIN_WORD_LEN)
        .filter(|wa| {
            words_b
                .iter()
                .filter(|wb| char_len(wb) >= MIN_WORD_LEN)
                .any(|wb| wb.contains(**wa) || wa.contains(*wb))
        })
        .count();

    (matched as f64 / total as f64) * WORD_OVERLAP_WEIGHT
}

/// Score for a short command phrase spoken inside a longer sentence:
/// `len(pattern) / len(utterance) * 100` when the normalized pattern occurs
/// in the normalized utterance, otherwise 0
pub fn embedded_score(pattern: &str, utterance: &str) -> f64 {
    if pattern.is_empty() || !utterance.contains(pattern) {
        return 0.0;
    }
    (char_len(pattern) as f64 / char_len(utterance) as f64) * EMBEDDED_WEIGHT
}
