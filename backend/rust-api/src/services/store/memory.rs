use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::{
    rank_by_cosine, same_label, CandidateFilter, ExamStore, ProgressReset, RecordedAnswer,
    ScoredChunk, ScoredNeighbor, StoreError, StoreResult,
};
use crate::models::question::{BankQuestion, DocumentChunk};
use crate::models::selection::TopicEntry;
use crate::models::{Attempt, AttemptMetadata, AttemptQuestion, AttemptStatus};

#[derive(Default)]
struct MemoryState {
    attempts: HashMap<String, Attempt>,
    /// attempt_id -> question_order -> row
    attempt_questions: HashMap<String, HashMap<u32, AttemptQuestion>>,
    questions: HashMap<String, BankQuestion>,
    /// insertion order, so candidate pools are stable across calls
    question_order: Vec<String>,
    content_keys: HashSet<String>,
    documents: Vec<DocumentChunk>,
    ontology: Vec<TopicEntry>,
}

impl MemoryState {
    /// Another `in_progress` attempt of `user_id`, mirroring the partial unique index.
    fn running_attempt_of(&self, user_id: &str, except_id: &str) -> Option<String> {
        self.attempts
            .values()
            .find(|a| {
                a.user_id == user_id && a.id != except_id && a.status == AttemptStatus::InProgress
            })
            .map(|a| a.id.clone())
    }
}

/// Process-local store with the same uniqueness and guard semantics as MongoDB.
/// Everything is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_questions(&self, questions: Vec<BankQuestion>) {
        let mut state = self.state.write().await;
        for question in questions {
            if state.content_keys.insert(question.content_key.clone()) {
                state.question_order.push(question.id.clone());
                state.questions.insert(question.id.clone(), question);
            }
        }
    }

    pub async fn seed_documents(&self, documents: Vec<DocumentChunk>) {
        self.state.write().await.documents.extend(documents);
    }

    pub async fn set_ontology(&self, ontology: Vec<TopicEntry>) {
        self.state.write().await.ontology = ontology;
    }

    pub async fn question_count(&self) -> usize {
        self.state.read().await.questions.len()
    }

    /// Overwrites an attempt as-is; lets tests stage drifted states.
    pub async fn put_attempt(&self, attempt: Attempt) {
        self.state
            .write()
            .await
            .attempts
            .insert(attempt.id.clone(), attempt);
    }

    /// Removes one slot row; lets tests simulate a silently lost insert.
    pub async fn remove_attempt_question(&self, attempt_id: &str, question_order: u32) -> bool {
        self.state
            .write()
            .await
            .attempt_questions
            .get_mut(attempt_id)
            .and_then(|rows| rows.remove(&question_order))
            .is_some()
    }
}

#[async_trait]
impl ExamStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.attempts.contains_key(&attempt.id) {
            return Err(StoreError::Conflict(format!(
                "attempt {} already exists",
                attempt.id
            )));
        }
        if attempt.status == AttemptStatus::InProgress {
            if let Some(running) = state.running_attempt_of(&attempt.user_id, &attempt.id) {
                return Err(StoreError::Conflict(format!(
                    "user {} already has attempt {} in progress",
                    attempt.user_id, running
                )));
            }
        }
        state.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        Ok(self.state.read().await.attempts.get(attempt_id).cloned())
    }

    async fn find_in_progress_attempt(&self, user_id: &str) -> StoreResult<Option<Attempt>> {
        let state = self.state.read().await;
        Ok(state
            .attempts
            .values()
            .filter(|a| a.user_id == user_id && a.status == AttemptStatus::InProgress)
            .max_by_key(|a| a.started_at)
            .cloned())
    }

    async fn list_attempts(&self, user_id: &str) -> StoreResult<Vec<Attempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<Attempt> = state
            .attempts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(attempts)
    }

    async fn recent_completed_attempts(
        &self,
        user_id: &str,
        exclude_attempt_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Attempt>> {
        let state = self.state.read().await;
        let mut attempts: Vec<Attempt> = state
            .attempts
            .values()
            .filter(|a| {
                a.user_id == user_id
                    && a.id != exclude_attempt_id
                    && a.status == AttemptStatus::Completed
            })
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        attempts.truncate(limit);
        Ok(attempts)
    }

    async fn advance_progress(
        &self,
        attempt_id: &str,
        questions_answered: u32,
        correct_count: u32,
    ) -> StoreResult<Option<Attempt>> {
        let mut state = self.state.write().await;
        match state.attempts.get_mut(attempt_id) {
            Some(attempt)
                if attempt.status == AttemptStatus::InProgress
                    && attempt.questions_answered < questions_answered
                    && questions_answered <= attempt.total_questions =>
            {
                attempt.questions_answered = questions_answered;
                attempt.correct_count = correct_count;
                Ok(Some(attempt.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_completed(
        &self,
        attempt_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.attempts.get_mut(attempt_id) {
            Some(attempt)
                if attempt.status == AttemptStatus::InProgress
                    && attempt.questions_answered == attempt.total_questions =>
            {
                attempt.status = AttemptStatus::Completed;
                attempt.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_progress(
        &self,
        attempt_id: &str,
        expected: AttemptStatus,
        reset: &ProgressReset,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if reset.status == AttemptStatus::InProgress && expected != AttemptStatus::InProgress {
            let owner = state.attempts.get(attempt_id).map(|a| a.user_id.clone());
            if let Some(running) = owner.and_then(|user| state.running_attempt_of(&user, attempt_id)) {
                return Err(StoreError::Conflict(format!(
                    "attempt {} is already in progress",
                    running
                )));
            }
        }
        match state.attempts.get_mut(attempt_id) {
            Some(attempt) if attempt.status == expected => {
                attempt.status = reset.status;
                attempt.questions_answered = reset.questions_answered;
                attempt.correct_count = reset.correct_count;
                attempt.completed_at = reset.completed_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_metadata(
        &self,
        attempt_id: &str,
        metadata: &AttemptMetadata,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let attempt = state
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))?;
        attempt.metadata = metadata.clone();
        Ok(())
    }

    async fn delete_attempts_for_user(&self, user_id: &str) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let ids: Vec<String> = state
            .attempts
            .values()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.id.clone())
            .collect();
        for id in &ids {
            state.attempts.remove(id);
            state.attempt_questions.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn list_attempt_questions(&self, attempt_id: &str) -> StoreResult<Vec<AttemptQuestion>> {
        let state = self.state.read().await;
        let mut rows: Vec<AttemptQuestion> = state
            .attempt_questions
            .get(attempt_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|row| row.question_order);
        Ok(rows)
    }

    async fn list_attempt_questions_for(
        &self,
        attempt_ids: &[String],
    ) -> StoreResult<Vec<AttemptQuestion>> {
        let state = self.state.read().await;
        Ok(attempt_ids
            .iter()
            .filter_map(|id| state.attempt_questions.get(id))
            .flat_map(|rows| rows.values().cloned())
            .collect())
    }

    async fn insert_attempt_question(&self, row: &AttemptQuestion) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let rows = state
            .attempt_questions
            .entry(row.attempt_id.clone())
            .or_default();
        if rows.contains_key(&row.question_order) {
            return Err(StoreError::Conflict(format!(
                "attempt {} already has question_order {}",
                row.attempt_id, row.question_order
            )));
        }
        rows.insert(row.question_order, row.clone());
        Ok(())
    }

    async fn record_answer(
        &self,
        attempt_id: &str,
        question_order: u32,
        answer: &RecordedAnswer,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(row) = state
            .attempt_questions
            .get_mut(attempt_id)
            .and_then(|rows| rows.get_mut(&question_order))
        else {
            return Ok(false);
        };
        if row.is_answered() {
            return Ok(false);
        }
        row.user_answer_index = Some(answer.answer_index);
        row.is_correct = Some(answer.is_correct);
        row.time_spent_seconds = Some(answer.time_spent_seconds);
        row.answered_at = Some(answer.answered_at);
        Ok(true)
    }

    async fn get_questions(&self, ids: &[String]) -> StoreResult<Vec<BankQuestion>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.questions.get(id).cloned())
            .collect())
    }

    async fn find_candidates(&self, filter: &CandidateFilter) -> StoreResult<Vec<BankQuestion>> {
        let state = self.state.read().await;
        let excluded: HashSet<&str> = filter.exclude_ids.iter().map(|s| s.as_str()).collect();
        Ok(state
            .question_order
            .iter()
            .filter_map(|id| state.questions.get(id))
            .filter(|q| !excluded.contains(q.id.as_str()))
            .filter(|q| {
                filter
                    .topic
                    .as_deref()
                    .map(|topic| same_label(&q.topic, topic))
                    .unwrap_or(true)
            })
            .filter(|q| filter.difficulty.map(|d| q.difficulty == d).unwrap_or(true))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn nearest_questions(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredNeighbor>> {
        let state = self.state.read().await;
        let items = state
            .questions
            .values()
            .filter(|q| topic.map(|t| same_label(&q.topic, t)).unwrap_or(true))
            .map(|q| (q.id.as_str(), q.embedding.as_slice()));
        Ok(rank_by_cosine(embedding, items, k)
            .into_iter()
            .map(|(question_id, score)| ScoredNeighbor { question_id, score })
            .collect())
    }

    async fn insert_question(&self, question: &BankQuestion) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.content_keys.insert(question.content_key.clone()) {
            return Err(StoreError::Conflict(format!(
                "content_key {} already stored",
                question.content_key
            )));
        }
        state.question_order.push(question.id.clone());
        state.questions.insert(question.id.clone(), question.clone());
        Ok(())
    }

    async fn find_question_by_content_key(&self, key: &str) -> StoreResult<Option<BankQuestion>> {
        let state = self.state.read().await;
        Ok(state
            .questions
            .values()
            .find(|q| q.content_key == key)
            .cloned())
    }

    async fn any_question_excluding(
        &self,
        exclude_ids: &[String],
    ) -> StoreResult<Option<BankQuestion>> {
        let state = self.state.read().await;
        let excluded: HashSet<&str> = exclude_ids.iter().map(|s| s.as_str()).collect();
        Ok(state
            .question_order
            .iter()
            .filter(|id| !excluded.contains(id.as_str()))
            .find_map(|id| state.questions.get(id).cloned()))
    }

    async fn search_documents(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        subtopic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        let state = self.state.read().await;
        let matching: Vec<&DocumentChunk> = state
            .documents
            .iter()
            .filter(|doc| topic.map(|t| same_label(&doc.topic, t)).unwrap_or(true))
            .filter(|doc| match (subtopic, doc.subtopic.as_deref()) {
                (Some(wanted), Some(actual)) => same_label(wanted, actual),
                _ => true,
            })
            .collect();
        let ranked = rank_by_cosine(
            embedding,
            matching.iter().map(|doc| (doc.id.as_str(), doc.embedding.as_slice())),
            k,
        );
        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| {
                matching
                    .iter()
                    .find(|doc| doc.id == id)
                    .map(|doc| ScoredChunk {
                        chunk: (*doc).clone(),
                        score,
                    })
            })
            .collect())
    }

    async fn list_ontology(&self) -> StoreResult<Vec<TopicEntry>> {
        Ok(self.state.read().await.ontology.clone())
    }
}
