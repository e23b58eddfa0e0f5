//! Fuzzy title matching for resolving web-search hits to PubMed records.

use std::collections::HashSet;

/// Words too common to carry signal in a title comparison.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "in", "of", "to", "is", "was", "for", "on",
    "with", "by", "from", "at", "as", "versus", "vs",
];

fn tokens(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t))
        .map(String::from)
        .collect()
}

/// Jaccard similarity over normalized title tokens, in [0, 1].
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// Minimum similarity for accepting a fuzzy match.
pub const MATCH_THRESHOLD: f64 = 0.75;

/// Pick the candidate title most similar to `needle`, if any clears the
/// threshold.
pub fn best_match<'a, T>(
    needle: &str,
    candidates: impl IntoIterator<Item = (&'a str, T)>,
) -> Option<T> {
    let mut best: Option<(f64, T)> = None;
    for (title, value) in candidates {
        let score = title_similarity(needle, title);
        if score >= MATCH_THRESHOLD && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, value));
        }
    }
    best.map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_titles_score_one() {
        let t = "Aspirin versus placebo in chronic headache";
        assert!((title_similarity(t, t) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reordered_and_cased_titles_still_match() {
        let a = "Aspirin versus placebo in chronic headache: a randomized trial";
        let b = "A Randomized Trial of Aspirin Versus Placebo in Chronic Headache";
        assert!(title_similarity(a, b) >= MATCH_THRESHOLD);
    }

    #[test]
    fn test_unrelated_titles_do_not_match() {
        let a = "Aspirin versus placebo in chronic headache";
        let b = "Deep learning for protein structure prediction";
        assert!(title_similarity(a, b) < MATCH_THRESHOLD);
    }

    #[test]
    fn test_best_match_picks_highest() {
        let needle = "Aspirin versus placebo in chronic headache";
        let candidates = vec![
            ("Ibuprofen versus placebo in chronic headache", "111"),
            ("Aspirin versus placebo in chronic headache trial", "222"),
        ];
        let hit = best_match(needle, candidates.iter().map(|(t, v)| (*t, *v)));
        assert_eq!(hit, Some("222"));
    }

    #[test]
    fn test_best_match_none_below_threshold() {
        let hit = best_match("completely different", vec![("another thing entirely", 1u32)]);
        assert_eq!(hit, None);
    }
}
