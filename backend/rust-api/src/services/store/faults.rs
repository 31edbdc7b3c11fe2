//! Fault injection for unit tests: a [`MemoryStore`] wrapper whose selected
//! operations fail a set number of times before delegating again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::memory::MemoryStore;
use super::{
    CandidateFilter, ExamStore, ProgressReset, RecordedAnswer, ScoredChunk, ScoredNeighbor,
    StoreError, StoreResult,
};
use crate::models::question::BankQuestion;
use crate::models::selection::TopicEntry;
use crate::models::{Attempt, AttemptMetadata, AttemptQuestion, AttemptStatus};

pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    /// operation name -> failures still to inject
    pending: Mutex<HashMap<&'static str, u32>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the next `times` calls of `operation` fail.
    ///
    /// `insert_attempt_question` fails with a slot conflict, `find_in_progress_attempt`
    /// answers as if nothing were running, everything else fails as a backend error.
    pub fn fail(&self, operation: &'static str, times: u32) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(operation, times);
        }
    }

    pub fn remaining(&self, operation: &'static str) -> u32 {
        self.pending
            .lock()
            .map(|pending| pending.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn trips(&self, operation: &'static str) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        if self.trips(operation) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExamStore for FaultyStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check("ping")?;
        self.inner.ping().await
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> StoreResult<()> {
        self.check("insert_attempt")?;
        self.inner.insert_attempt(attempt).await
    }

    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        self.check("get_attempt")?;
        self.inner.get_attempt(attempt_id).await
    }

    async fn find_in_progress_attempt(&self, user_id: &str) -> StoreResult<Option<Attempt>> {
        if self.trips("find_in_progress_attempt") {
            return Ok(None);
        }
        self.inner.find_in_progress_attempt(user_id).await
    }

    async fn list_attempts(&self, user_id: &str) -> StoreResult<Vec<Attempt>> {
        self.check("list_attempts")?;
        self.inner.list_attempts(user_id).await
    }

    async fn recent_completed_attempts(
        &self,
        user_id: &str,
        exclude_attempt_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Attempt>> {
        self.check("recent_completed_attempts")?;
        self.inner
            .recent_completed_attempts(user_id, exclude_attempt_id, limit)
            .await
    }

    async fn advance_progress(
        &self,
        attempt_id: &str,
        questions_answered: u32,
        correct_count: u32,
    ) -> StoreResult<Option<Attempt>> {
        self.check("advance_progress")?;
        self.inner
            .advance_progress(attempt_id, questions_answered, correct_count)
            .await
    }

    async fn mark_completed(
        &self,
        attempt_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check("mark_completed")?;
        self.inner.mark_completed(attempt_id, completed_at).await
    }

    async fn reset_progress(
        &self,
        attempt_id: &str,
        expected: AttemptStatus,
        reset: &ProgressReset,
    ) -> StoreResult<bool> {
        self.check("reset_progress")?;
        self.inner.reset_progress(attempt_id, expected, reset).await
    }

    async fn update_metadata(
        &self,
        attempt_id: &str,
        metadata: &AttemptMetadata,
    ) -> StoreResult<()> {
        self.check("update_metadata")?;
        self.inner.update_metadata(attempt_id, metadata).await
    }

    async fn delete_attempts_for_user(&self, user_id: &str) -> StoreResult<u64> {
        self.check("delete_attempts_for_user")?;
        self.inner.delete_attempts_for_user(user_id).await
    }

    async fn list_attempt_questions(&self, attempt_id: &str) -> StoreResult<Vec<AttemptQuestion>> {
        self.check("list_attempt_questions")?;
        self.inner.list_attempt_questions(attempt_id).await
    }

    async fn list_attempt_questions_for(
        &self,
        attempt_ids: &[String],
    ) -> StoreResult<Vec<AttemptQuestion>> {
        self.check("list_attempt_questions_for")?;
        self.inner.list_attempt_questions_for(attempt_ids).await
    }

    async fn insert_attempt_question(&self, row: &AttemptQuestion) -> StoreResult<()> {
        if self.trips("insert_attempt_question") {
            return Err(StoreError::Conflict(format!(
                "attempt {} slot {} taken by a concurrent writer",
                row.attempt_id, row.question_order
            )));
        }
        self.inner.insert_attempt_question(row).await
    }

    async fn record_answer(
        &self,
        attempt_id: &str,
        question_order: u32,
        answer: &RecordedAnswer,
    ) -> StoreResult<bool> {
        self.check("record_answer")?;
        self.inner
            .record_answer(attempt_id, question_order, answer)
            .await
    }

    async fn get_questions(&self, ids: &[String]) -> StoreResult<Vec<BankQuestion>> {
        self.check("get_questions")?;
        self.inner.get_questions(ids).await
    }

    async fn find_candidates(&self, filter: &CandidateFilter) -> StoreResult<Vec<BankQuestion>> {
        self.check("find_candidates")?;
        self.inner.find_candidates(filter).await
    }

    async fn nearest_questions(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredNeighbor>> {
        self.check("nearest_questions")?;
        self.inner.nearest_questions(embedding, topic, k).await
    }

    async fn insert_question(&self, question: &BankQuestion) -> StoreResult<()> {
        self.check("insert_question")?;
        self.inner.insert_question(question).await
    }

    async fn find_question_by_content_key(&self, key: &str) -> StoreResult<Option<BankQuestion>> {
        self.check("find_question_by_content_key")?;
        self.inner.find_question_by_content_key(key).await
    }

    async fn any_question_excluding(
        &self,
        exclude_ids: &[String],
    ) -> StoreResult<Option<BankQuestion>> {
        self.check("any_question_excluding")?;
        self.inner.any_question_excluding(exclude_ids).await
    }

    async fn search_documents(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        subtopic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        self.check("search_documents")?;
        self.inner
            .search_documents(embedding, topic, subtopic, k)
            .await
    }

    async fn list_ontology(&self) -> StoreResult<Vec<TopicEntry>> {
        self.check("list_ontology")?;
        self.inner.list_ontology().await
    }
}
