use rand::Rng;
use std::collections::HashMap;

/// Samples an index proportionally to `weights`.
///
/// Negative and non-finite weights count as zero. When every weight is zero the
/// pick falls back to a uniform choice. Returns `None` only for an empty slice.
pub fn weighted_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    let sanitized: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .collect();
    let total: f64 = sanitized.iter().sum();

    if total <= 0.0 {
        return Some(rng.random_range(0..weights.len()));
    }

    let mut target = rng.random_range(0.0..total);
    for (index, weight) in sanitized.iter().enumerate() {
        if *weight == 0.0 {
            continue;
        }
        if target < *weight {
            return Some(index);
        }
        target -= weight;
    }

    // Float rounding can leave a sliver past the last bucket.
    sanitized.iter().rposition(|w| *w > 0.0)
}

/// Inverse-frequency weights: categories seen less often get a larger weight.
///
/// Counts are looked up case-insensitively so "React" and "react" share a bucket.
pub fn coverage_weights(categories: &[String], counts: &HashMap<String, u32>) -> Vec<f64> {
    let normalized: HashMap<String, u32> = counts
        .iter()
        .map(|(key, count)| (key.trim().to_lowercase(), *count))
        .fold(HashMap::new(), |mut acc, (key, count)| {
            *acc.entry(key).or_insert(0) += count;
            acc
        });

    categories
        .iter()
        .map(|category| {
            let seen = normalized
                .get(&category.trim().to_lowercase())
                .copied()
                .unwrap_or(0);
            1.0 / (1.0 + seen as f64)
        })
        .collect()
}

/// Draws one category using [`coverage_weights`]; `None` for an empty list.
pub fn pick_least_covered<R: Rng + ?Sized>(
    categories: &[String],
    counts: &HashMap<String, u32>,
    rng: &mut R,
) -> Option<String> {
    let weights = coverage_weights(categories, counts);
    weighted_index(&weights, rng).map(|index| categories[index].clone())
}
