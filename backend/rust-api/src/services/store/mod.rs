//! Persistent-store contract for attempts, attempt questions, the question bank,
//! the retrieval corpus and the topic ontology.
//!
//! Two backends implement [`ExamStore`]: [`mongo::MongoStore`] for deployments and
//! [`memory::MemoryStore`] for local development and tests. Both enforce the same
//! uniqueness rules and conditional counter updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::question::{BankQuestion, Difficulty, DocumentChunk};
use crate::models::selection::TopicEntry;
use crate::models::{Attempt, AttemptMetadata, AttemptQuestion, AttemptStatus};
use crate::utils::similarity::cosine_similarity;

#[cfg(test)]
pub(crate) mod faults;
pub mod memory;
pub mod mongo;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness violation, e.g. a second row for the same `(attempt_id, question_order)`.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Loose filter used to pull a candidate pool from the bank.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub topic: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub exclude_ids: Vec<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNeighbor {
    pub question_id: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// Counter overwrite used only by the recovery operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReset {
    pub status: AttemptStatus,
    pub questions_answered: u32,
    pub correct_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ExamStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Fails with [`StoreError::Conflict`] when the user already has an attempt
    /// `in_progress`.
    async fn insert_attempt(&self, attempt: &Attempt) -> StoreResult<()>;
    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>>;
    async fn find_in_progress_attempt(&self, user_id: &str) -> StoreResult<Option<Attempt>>;
    /// Newest first.
    async fn list_attempts(&self, user_id: &str) -> StoreResult<Vec<Attempt>>;
    /// The user's most recently completed attempts other than `exclude_attempt_id`.
    async fn recent_completed_attempts(
        &self,
        user_id: &str,
        exclude_attempt_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Attempt>>;
    /// Raises the counters to values tallied from the attempt's answered rows. Matches
    /// only while the attempt is `in_progress`, the stored count is lower and the new
    /// count fits in `total_questions`, so replays and stale tallies are no-ops.
    /// `None` when the guard did not match.
    async fn advance_progress(
        &self,
        attempt_id: &str,
        questions_answered: u32,
        correct_count: u32,
    ) -> StoreResult<Option<Attempt>>;
    /// Flips `in_progress` to `completed` only when `questions_answered == total_questions`.
    async fn mark_completed(
        &self,
        attempt_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Overwrites status and counters when the attempt is still in `expected` status.
    /// Reopening fails with [`StoreError::Conflict`] when the user already has another
    /// attempt `in_progress`.
    async fn reset_progress(
        &self,
        attempt_id: &str,
        expected: AttemptStatus,
        reset: &ProgressReset,
    ) -> StoreResult<bool>;
    async fn update_metadata(&self, attempt_id: &str, metadata: &AttemptMetadata)
        -> StoreResult<()>;
    /// Deletes the user's attempts and their rows; returns the attempt count.
    async fn delete_attempts_for_user(&self, user_id: &str) -> StoreResult<u64>;

    /// Ordered by `question_order`.
    async fn list_attempt_questions(&self, attempt_id: &str) -> StoreResult<Vec<AttemptQuestion>>;
    async fn list_attempt_questions_for(
        &self,
        attempt_ids: &[String],
    ) -> StoreResult<Vec<AttemptQuestion>>;
    /// Fails with [`StoreError::Conflict`] when the slot is already taken.
    async fn insert_attempt_question(&self, row: &AttemptQuestion) -> StoreResult<()>;
    /// Writes the answer only if the slot is still unanswered.
    async fn record_answer(
        &self,
        attempt_id: &str,
        question_order: u32,
        answer: &RecordedAnswer,
    ) -> StoreResult<bool>;

    async fn get_questions(&self, ids: &[String]) -> StoreResult<Vec<BankQuestion>>;
    async fn find_candidates(&self, filter: &CandidateFilter) -> StoreResult<Vec<BankQuestion>>;
    async fn nearest_questions(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredNeighbor>>;
    /// Fails with [`StoreError::Conflict`] on a duplicate `content_key`.
    async fn insert_question(&self, question: &BankQuestion) -> StoreResult<()>;
    async fn find_question_by_content_key(&self, key: &str) -> StoreResult<Option<BankQuestion>>;
    async fn any_question_excluding(
        &self,
        exclude_ids: &[String],
    ) -> StoreResult<Option<BankQuestion>>;

    async fn search_documents(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        subtopic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>>;
    async fn list_ontology(&self) -> StoreResult<Vec<TopicEntry>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAnswer {
    pub answer_index: u8,
    pub is_correct: bool,
    pub time_spent_seconds: u32,
    pub answered_at: DateTime<Utc>,
}

/// Ranks `(id, embedding)` pairs by cosine similarity to `query`, best first.
pub(crate) fn rank_by_cosine<'a, I>(query: &[f32], items: I, k: usize) -> Vec<(String, f32)>
where
    I: IntoIterator<Item = (&'a str, &'a [f32])>,
{
    let mut scored: Vec<(String, f32)> = items
        .into_iter()
        .filter(|(_, embedding)| !embedding.is_empty())
        .map(|(id, embedding)| (id.to_string(), cosine_similarity(query, embedding)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

pub(crate) fn same_label(left: &str, right: &str) -> bool {
    left.trim().eq_ignore_ascii_case(right.trim())
}
