use std::collections::HashSet;

/// Cosine similarity of two embedding vectors.
///
/// Returns 0.0 for empty vectors, vectors of different length, or a zero-norm
/// side, so callers can treat "no embedding" as "not similar".
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Highest cosine similarity between `candidate` and any of `others`.
pub fn max_cosine_similarity<'a, I>(candidate: &[f32], others: I) -> f32
where
    I: IntoIterator<Item = &'a [f32]>,
{
    others
        .into_iter()
        .map(|other| cosine_similarity(candidate, other))
        .fold(0.0f32, f32::max)
}

/// Lowercased alphanumeric tokens, short stop-ish tokens dropped.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(|token| token.to_lowercase())
        .collect()
}

/// Jaccard overlap of the token sets of two texts (0.0..=1.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = tokenize(a);
    let right = tokenize(b);
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Collapses whitespace and case so cosmetic edits do not change content keys.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_mismatched_and_zero_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn max_cosine_picks_closest() {
        let candidate = [1.0, 0.0];
        let others: Vec<Vec<f32>> = vec![vec![0.0, 1.0], vec![1.0, 0.1]];
        let best = max_cosine_similarity(&candidate, others.iter().map(|v| v.as_slice()));
        assert!(best > 0.99);
        assert_eq!(max_cosine_similarity(&candidate, std::iter::empty()), 0.0);
    }

    #[test]
    fn jaccard_measures_token_overlap() {
        let a = "What does useEffect return in React?";
        let b = "What does useEffect return in React components?";
        let c = "Explain CSS grid template areas";
        assert!(jaccard_similarity(a, b) > 0.7);
        assert!(jaccard_similarity(a, c) < 0.1);
        assert_eq!(jaccard_similarity("", ""), 0.0);
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  Hello\n  World "), "hello world");
    }
}
