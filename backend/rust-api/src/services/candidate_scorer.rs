//! Scores bank candidates against the target profile and picks one.
//!
//! Scoring is pure and deterministic; the only randomness is the weighted draw
//! among the top-K, which takes an injected RNG.

use rand::Rng;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::models::question::BankQuestion;
use crate::models::selection::{Distributions, SelectionCriteria};
use crate::services::store::same_label;
use crate::utils::sampling::weighted_index;
use crate::utils::similarity::{jaccard_similarity, max_cosine_similarity};

pub const TOPIC_MATCH_BOOST: f64 = 3.0;
pub const SUBTOPIC_MATCH_BOOST: f64 = 2.0;
pub const BLOOM_MATCH_BOOST: f64 = 1.5;
pub const CODING_MATCH_BOOST: f64 = 2.0;
pub const DIFFICULTY_MATCH_BOOST: f64 = 2.5;

pub const TOPIC_BALANCE_PENALTY: f64 = 3.0;
pub const FRESHNESS_PENALTY: f64 = 4.0;

pub const ATTEMPT_SIMILARITY_MEDIUM: f32 = 0.85;
pub const ATTEMPT_SIMILARITY_HIGH: f32 = 0.92;
pub const ATTEMPT_SIMILARITY_MEDIUM_PENALTY: f64 = 3.0;
pub const ATTEMPT_SIMILARITY_HIGH_PENALTY: f64 = 8.0;

pub const NEIGHBOR_SIMILARITY_MEDIUM: f32 = 0.90;
pub const NEIGHBOR_SIMILARITY_HIGH: f32 = 0.96;
pub const NEIGHBOR_SIMILARITY_MEDIUM_PENALTY: f64 = 1.0;
pub const NEIGHBOR_SIMILARITY_HIGH_PENALTY: f64 = 2.5;

/// Word-overlap level treated like a high embedding similarity.
pub const TEXT_OVERLAP_HIGH: f64 = 0.6;

/// Candidates scoring below this are never served.
pub const USABILITY_FLOOR: f64 = 0.0;

pub const MIN_TOPIC_CAP: u32 = 2;

/// What the current attempt has already been asked, plus cross-attempt history.
#[derive(Debug, Clone, Default)]
pub struct AskedContext {
    pub question_ids: HashSet<String>,
    pub embeddings: Vec<Vec<f32>>,
    pub texts: Vec<String>,
    /// Questions served in the user's last two completed attempts.
    pub recent_ids: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub question: BankQuestion,
    pub score: f64,
}

/// Share of the assigned slots one topic may hold before it is penalised.
/// Tight early so the first questions do not cluster.
pub fn topic_share(assigned: u32) -> f64 {
    match assigned {
        0..=19 => 0.25,
        20..=39 => 0.30,
        _ => 0.35,
    }
}

pub fn topic_cap(assigned: u32) -> u32 {
    let cap = (assigned as f64 * topic_share(assigned)).ceil() as u32;
    cap.max(MIN_TOPIC_CAP)
}

fn topic_balance_penalty(count: u32, cap: u32) -> f64 {
    if count < cap {
        0.0
    } else {
        TOPIC_BALANCE_PENALTY * (count - cap + 1) as f64
    }
}

fn attempt_similarity_penalty(question: &BankQuestion, asked: &AskedContext) -> f64 {
    let cosine = if question.embedding.is_empty() {
        0.0
    } else {
        max_cosine_similarity(
            &question.embedding,
            asked.embeddings.iter().map(|e| e.as_slice()),
        )
    };
    let text_overlap = asked
        .texts
        .iter()
        .map(|text| jaccard_similarity(&question.question, text))
        .fold(0.0_f64, f64::max);

    if cosine > ATTEMPT_SIMILARITY_HIGH || text_overlap > TEXT_OVERLAP_HIGH {
        ATTEMPT_SIMILARITY_HIGH_PENALTY
    } else if cosine > ATTEMPT_SIMILARITY_MEDIUM {
        ATTEMPT_SIMILARITY_MEDIUM_PENALTY
    } else {
        0.0
    }
}

fn neighbor_similarity_penalty(similarity: f32) -> f64 {
    if similarity > NEIGHBOR_SIMILARITY_HIGH {
        NEIGHBOR_SIMILARITY_HIGH_PENALTY
    } else if similarity > NEIGHBOR_SIMILARITY_MEDIUM {
        NEIGHBOR_SIMILARITY_MEDIUM_PENALTY
    } else {
        0.0
    }
}

/// Score without the bank-neighbour term; `None` when the question was already
/// asked in this attempt.
pub fn score_candidate(
    question: &BankQuestion,
    criteria: &SelectionCriteria,
    distributions: &Distributions,
    asked: &AskedContext,
) -> Option<f64> {
    if asked.question_ids.contains(&question.id) || !question.is_well_formed() {
        return None;
    }

    let mut score = 0.0;
    if same_label(&question.topic, &criteria.preferred_topic) {
        score += TOPIC_MATCH_BOOST;
    }
    if let (Some(wanted), Some(actual)) = (
        criteria.preferred_subtopic.as_deref(),
        question.subtopic.as_deref(),
    ) {
        if same_label(wanted, actual) {
            score += SUBTOPIC_MATCH_BOOST;
        }
    }
    if question.bloom_level == criteria.preferred_bloom_level {
        score += BLOOM_MATCH_BOOST;
    }
    if question.is_coding() == criteria.coding_mode {
        score += CODING_MATCH_BOOST;
    }
    if question.difficulty == criteria.difficulty {
        score += DIFFICULTY_MATCH_BOOST;
    }

    let cap = topic_cap(distributions.assigned());
    score -= topic_balance_penalty(distributions.topic_count(&question.topic), cap);

    if asked.recent_ids.contains(&question.id) {
        score -= FRESHNESS_PENALTY;
    }

    score -= attempt_similarity_penalty(question, asked);
    Some(score)
}

fn by_score_desc(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.question.id.cmp(&b.question.id))
}

/// Scores and sorts a pool, best first. Hard-excluded candidates are dropped.
pub fn rank_candidates(
    pool: Vec<BankQuestion>,
    criteria: &SelectionCriteria,
    distributions: &Distributions,
    asked: &AskedContext,
) -> Vec<ScoredCandidate> {
    let mut seen = HashSet::new();
    let mut ranked: Vec<ScoredCandidate> = pool
        .into_iter()
        .filter(|question| seen.insert(question.id.clone()))
        .filter_map(|question| {
            score_candidate(&question, criteria, distributions, asked)
                .map(|score| ScoredCandidate { question, score })
        })
        .collect();
    ranked.sort_by(by_score_desc);
    ranked
}

/// Subtracts the bank-neighbour penalty (keyed by question id) and re-sorts.
pub fn apply_neighbor_penalties(ranked: &mut [ScoredCandidate], neighbors: &HashMap<String, f32>) {
    for candidate in ranked.iter_mut() {
        if let Some(similarity) = neighbors.get(&candidate.question.id) {
            candidate.score -= neighbor_similarity_penalty(*similarity);
        }
    }
    ranked.sort_by(by_score_desc);
}

/// Weighted draw among the top `top_k` usable candidates, weight `max(score, 1)`.
/// `None` means no acceptable candidate.
pub fn pick_top_k<R: Rng + ?Sized>(
    ranked: Vec<ScoredCandidate>,
    top_k: usize,
    rng: &mut R,
) -> Option<ScoredCandidate> {
    let mut usable: Vec<ScoredCandidate> = ranked
        .into_iter()
        .filter(|candidate| candidate.score >= USABILITY_FLOOR)
        .take(top_k.max(1))
        .collect();
    if usable.is_empty() {
        return None;
    }

    let weights: Vec<f64> = usable.iter().map(|c| c.score.max(1.0)).collect();
    let index = weighted_index(&weights, rng)?;
    Some(usable.swap_remove(index))
}
