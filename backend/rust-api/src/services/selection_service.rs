//! Next-question pipeline: pending slot, coverage, criteria, bank pick or
//! generation, then slot reservation.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::{ExamError, ExamResult};
use crate::metrics::{record_fallback, QUESTIONS_ASSIGNED_TOTAL};
use crate::models::question::{BankQuestion, PublicQuestion};
use crate::models::selection::SelectionCriteria;
use crate::models::Attempt;
use crate::services::assignment_service::{AssignmentService, SlotOutcome};
use crate::services::candidate_scorer::{
    apply_neighbor_penalties, pick_top_k, rank_candidates, AskedContext, ScoredCandidate,
};
use crate::services::criteria_service::{CriteriaInput, CriteriaService};
use crate::services::distribution::{compute_distributions, load_assigned, AssignedQuestion};
use crate::services::ontology_service::OntologyService;
use crate::services::question_generator::QuestionGenerator;
use crate::services::store::{CandidateFilter, ExamStore};
use crate::services::AppState;

/// Completed attempts whose questions count as "seen recently".
const FRESHNESS_WINDOW: usize = 2;
/// A chosen question can go stale if a concurrent request used it; re-plan this often.
const MAX_PLANNING_PASSES: usize = 2;
const NEIGHBORS_PER_CANDIDATE: usize = 2;

pub struct SelectionService {
    store: Arc<dyn ExamStore>,
    ontology: OntologyService,
    criteria: CriteriaService,
    generator: QuestionGenerator,
    assignment: AssignmentService,
    candidate_pool_limit: usize,
    top_k: usize,
}

impl SelectionService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
            ontology: OntologyService::new(state.store.clone(), state.redis.clone()),
            criteria: CriteriaService::new(state.llm.clone(), state.llm_timeout()),
            generator: QuestionGenerator::new(
                state.store.clone(),
                state.llm.clone(),
                state.embeddings.clone(),
                state.llm_timeout(),
                state.config.llm.judge_enabled,
            ),
            assignment: AssignmentService::new(state.store.clone()),
            candidate_pool_limit: state.config.exam.candidate_pool_limit,
            top_k: state.config.exam.top_k,
        }
    }

    /// Returns the question the candidate should answer next, assigning one if needed.
    /// `None` when every slot is assigned and answered.
    pub async fn next_question<R: Rng + Send + ?Sized>(
        &self,
        attempt: &Attempt,
        rng: &mut R,
    ) -> ExamResult<Option<PublicQuestion>> {
        for pass in 1..=MAX_PLANNING_PASSES {
            let assigned = load_assigned(self.store.as_ref(), &attempt.id).await?;

            if let Some(pending) = assigned.iter().find(|a| !a.row.is_answered()) {
                return Ok(Some(pending.question.public_view(pending.row.question_order)));
            }
            if assigned.len() as u32 >= attempt.total_questions {
                return Ok(None);
            }

            let (question, source) = self.choose(attempt, &assigned, rng).await?;

            match self
                .assignment
                .reserve(&attempt.id, &question.id, attempt.total_questions)
                .await?
            {
                SlotOutcome::Assigned(row) => {
                    QUESTIONS_ASSIGNED_TOTAL.with_label_values(&[source]).inc();
                    return Ok(Some(question.public_view(row.question_order)));
                }
                SlotOutcome::Occupied(row) => {
                    let served = self
                        .store
                        .get_questions(std::slice::from_ref(&row.question_id))
                        .await?
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            ExamError::NotFound(format!("Question {} not found", row.question_id))
                        })?;
                    return Ok(Some(served.public_view(row.question_order)));
                }
                SlotOutcome::Stale => {
                    tracing::warn!(
                        "Question {} went stale for attempt {} (pass {}/{})",
                        question.id,
                        attempt.id,
                        pass,
                        MAX_PLANNING_PASSES
                    );
                }
            }
        }

        Err(ExamError::state_conflict(
            "selection_contended",
            format!("Attempt {} is being updated concurrently, retry", attempt.id),
        ))
    }

    async fn choose<R: Rng + Send + ?Sized>(
        &self,
        attempt: &Attempt,
        assigned: &[AssignedQuestion],
        rng: &mut R,
    ) -> ExamResult<(BankQuestion, &'static str)> {
        let distributions = compute_distributions(assigned.iter().map(|a| &a.question));
        let topics = self.ontology.topics().await;
        let criteria = self
            .criteria
            .select(
                &CriteriaInput {
                    attempt_id: &attempt.id,
                    total_questions: attempt.total_questions,
                    questions_answered: attempt.questions_answered,
                    distributions: &distributions,
                    topics: &topics,
                },
                rng,
            )
            .await;

        let asked = self.asked_context(attempt, assigned).await?;
        let pool = self.candidate_pool(&criteria, &asked).await?;
        let pool_size = pool.len();

        let mut ranked = rank_candidates(pool, &criteria, &distributions, &asked);
        let neighbors = self.neighbor_similarity(&ranked).await;
        apply_neighbor_penalties(&mut ranked, &neighbors);

        if let Some(ScoredCandidate { question, score }) = pick_top_k(ranked, self.top_k, rng) {
            tracing::debug!(
                "Picked bank question {} for attempt {} (score {:.2}, pool {})",
                question.id,
                attempt.id,
                score,
                pool_size
            );
            return Ok((question, "bank"));
        }

        tracing::info!(
            "No acceptable bank candidate for attempt {} among {}; generating",
            attempt.id,
            pool_size
        );
        record_fallback("bank");
        let generated = self.generator.generate(&attempt.id, &criteria, &asked).await?;
        Ok((generated.question, if generated.reused { "bank" } else { "generated" }))
    }

    async fn asked_context(
        &self,
        attempt: &Attempt,
        assigned: &[AssignedQuestion],
    ) -> ExamResult<AskedContext> {
        let recent: Vec<String> = self
            .store
            .recent_completed_attempts(&attempt.user_id, &attempt.id, FRESHNESS_WINDOW)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let recent_ids: HashSet<String> = self
            .store
            .list_attempt_questions_for(&recent)
            .await?
            .into_iter()
            .map(|row| row.question_id)
            .collect();

        Ok(AskedContext {
            question_ids: assigned.iter().map(|a| a.question.id.clone()).collect(),
            embeddings: assigned
                .iter()
                .filter(|a| !a.question.embedding.is_empty())
                .map(|a| a.question.embedding.clone())
                .collect(),
            texts: assigned.iter().map(|a| a.question.question.clone()).collect(),
            recent_ids,
        })
    }

    /// Tightest filter first, widened until the pool can fill the top-K.
    async fn candidate_pool(
        &self,
        criteria: &SelectionCriteria,
        asked: &AskedContext,
    ) -> ExamResult<Vec<BankQuestion>> {
        let exclude: Vec<String> = asked.question_ids.iter().cloned().collect();
        let filters = [
            (Some(criteria.preferred_topic.clone()), Some(criteria.difficulty)),
            (Some(criteria.preferred_topic.clone()), None),
            (None, Some(criteria.difficulty)),
            (None, None),
        ];

        let mut pool: Vec<BankQuestion> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (topic, difficulty) in filters {
            if pool.len() >= self.top_k {
                break;
            }
            let filter = CandidateFilter {
                topic,
                difficulty,
                exclude_ids: exclude.clone(),
                limit: self.candidate_pool_limit,
            };
            for question in self.store.find_candidates(&filter).await? {
                if pool.len() >= self.candidate_pool_limit {
                    break;
                }
                if seen.insert(question.id.clone()) {
                    pool.push(question);
                }
            }
        }
        Ok(pool)
    }

    /// Best bank-wide neighbour similarity for the leading candidates.
    async fn neighbor_similarity(&self, ranked: &[ScoredCandidate]) -> HashMap<String, f32> {
        let mut similarity = HashMap::new();
        for candidate in ranked.iter().take(self.top_k * 2) {
            let question = &candidate.question;
            if question.embedding.is_empty() {
                continue;
            }
            match self
                .store
                .nearest_questions(
                    &question.embedding,
                    Some(&question.topic),
                    NEIGHBORS_PER_CANDIDATE,
                )
                .await
            {
                Ok(neighbors) => {
                    let best = neighbors
                        .into_iter()
                        .filter(|n| n.question_id != question.id)
                        .map(|n| n.score)
                        .fold(0.0_f32, f32::max);
                    similarity.insert(question.id.clone(), best);
                }
                Err(e) => {
                    tracing::warn!("Neighbour lookup failed, skipping penalty: {}", e);
                    break;
                }
            }
        }
        similarity
    }
}
