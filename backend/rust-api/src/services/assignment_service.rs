use std::sync::Arc;

use crate::errors::{ExamError, ExamResult};
use crate::metrics::ASSIGNMENT_CONFLICTS_TOTAL;
use crate::models::AttemptQuestion;
use crate::services::store::{ExamStore, StoreError};
use crate::utils::retry::RetryConfig;

/// Result of trying to bind a question to the next free slot.
#[derive(Debug, Clone)]
pub enum SlotOutcome {
    /// A new row was inserted for this question.
    Assigned(AttemptQuestion),
    /// Another request filled the slot first; its pending row should be served.
    Occupied(AttemptQuestion),
    /// The chosen question was assigned elsewhere in the attempt meanwhile.
    Stale,
}

/// Reserves `question_order` slots. The store's unique `(attempt_id, question_order)`
/// constraint is the only coordination between concurrent requests.
pub struct AssignmentService {
    store: Arc<dyn ExamStore>,
    retry: RetryConfig,
}

impl AssignmentService {
    pub fn new(store: Arc<dyn ExamStore>) -> Self {
        Self::with_retry(store, RetryConfig::assignment())
    }

    pub fn with_retry(store: Arc<dyn ExamStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Binds `question_id` to the lowest free order in `1..=total_questions`.
    ///
    /// Fails with [`ExamError::AssignmentExhausted`] after the retry budget; a slot is
    /// never skipped and no row is left behind on failure.
    pub async fn reserve(
        &self,
        attempt_id: &str,
        question_id: &str,
        total_questions: u32,
    ) -> ExamResult<SlotOutcome> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut target_order = 0;

        for attempt in 1..=max_attempts {
            let rows = self.store.list_attempt_questions(attempt_id).await?;

            if let Some(pending) = rows.iter().find(|row| !row.is_answered()) {
                return Ok(SlotOutcome::Occupied(pending.clone()));
            }
            if rows.iter().any(|row| row.question_id == question_id) {
                return Ok(SlotOutcome::Stale);
            }

            target_order = match lowest_free_order(&rows, total_questions) {
                Some(order) => order,
                None => {
                    return Err(ExamError::state_conflict(
                        "attempt_full",
                        format!("Attempt {} has no free question slot", attempt_id),
                    ))
                }
            };

            let row = AttemptQuestion::new(attempt_id, question_id, target_order);
            match self.store.insert_attempt_question(&row).await {
                Ok(()) => {
                    tracing::info!(
                        "Assigned question {} to attempt {} slot {}",
                        question_id,
                        attempt_id,
                        target_order
                    );
                    return Ok(SlotOutcome::Assigned(row));
                }
                Err(StoreError::Conflict(detail)) => {
                    ASSIGNMENT_CONFLICTS_TOTAL.inc();
                    tracing::warn!(
                        "Slot {} of attempt {} taken concurrently (try {}/{}): {}",
                        target_order,
                        attempt_id,
                        attempt,
                        max_attempts,
                        detail
                    );
                }
                Err(StoreError::Backend(e)) => {
                    tracing::warn!(
                        "Slot {} insert for attempt {} failed (try {}/{}): {}",
                        target_order,
                        attempt_id,
                        attempt,
                        max_attempts,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry.backoff_for(attempt)).await;
            }
        }

        tracing::error!(
            "Giving up on slot {} of attempt {} after {} tries",
            target_order,
            attempt_id,
            max_attempts
        );
        Err(ExamError::AssignmentExhausted {
            order: target_order,
            attempts: max_attempts,
        })
    }

    /// Inserts at an exact order with no retry; used by sequence repair.
    pub async fn insert_exact(
        &self,
        attempt_id: &str,
        question_id: &str,
        question_order: u32,
    ) -> ExamResult<AttemptQuestion> {
        let row = AttemptQuestion::new(attempt_id, question_id, question_order);
        self.store.insert_attempt_question(&row).await?;
        Ok(row)
    }
}

/// Smallest order in `1..=total` not present in `rows`.
pub fn lowest_free_order(rows: &[AttemptQuestion], total: u32) -> Option<u32> {
    let taken: std::collections::HashSet<u32> = rows.iter().map(|r| r.question_order).collect();
    (1..=total).find(|order| !taken.contains(order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::faults::FaultyStore;
    use crate::services::store::memory::MemoryStore;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter_max: None,
        }
    }

    fn answered(attempt_id: &str, question_id: &str, order: u32) -> AttemptQuestion {
        let mut row = AttemptQuestion::new(attempt_id, question_id, order);
        row.user_answer_index = Some(0);
        row.is_correct = Some(true);
        row
    }

    #[test]
    fn lowest_free_order_fills_gaps_first() {
        let rows = vec![answered("a", "q1", 1), answered("a", "q3", 3)];
        assert_eq!(lowest_free_order(&rows, 5), Some(2));
        assert_eq!(lowest_free_order(&[], 5), Some(1));
        let full: Vec<AttemptQuestion> = (1..=2).map(|i| answered("a", "q", i)).collect();
        assert_eq!(lowest_free_order(&full, 2), None);
    }

    #[tokio::test]
    async fn reserves_the_next_contiguous_slot() {
        let store = Arc::new(MemoryStore::new());
        store.insert_attempt_question(&answered("a1", "q1", 1)).await.unwrap();
        let service = AssignmentService::with_retry(store.clone(), fast_retry());

        match service.reserve("a1", "q2", 60).await.unwrap() {
            SlotOutcome::Assigned(row) => assert_eq!(row.question_order, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_row_is_served_instead_of_a_second_insert() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_attempt_question(&AttemptQuestion::new("a1", "q1", 1))
            .await
            .unwrap();
        let service = AssignmentService::with_retry(store.clone(), fast_retry());

        match service.reserve("a1", "q2", 60).await.unwrap() {
            SlotOutcome::Occupied(row) => assert_eq!(row.question_id, "q1"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(store.list_attempt_questions("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn already_used_question_is_stale() {
        let store = Arc::new(MemoryStore::new());
        store.insert_attempt_question(&answered("a1", "q1", 1)).await.unwrap();
        let service = AssignmentService::with_retry(store, fast_retry());
        assert!(matches!(
            service.reserve("a1", "q1", 60).await.unwrap(),
            SlotOutcome::Stale
        ));
    }

    #[tokio::test]
    async fn concurrent_reservations_leave_one_row() {
        let store = Arc::new(MemoryStore::new());
        let first = AssignmentService::with_retry(store.clone(), fast_retry());
        let second = AssignmentService::with_retry(store.clone(), fast_retry());

        let (a, b) = tokio::join!(first.reserve("a1", "q1", 60), second.reserve("a1", "q2", 60));
        let outcomes = [a.unwrap(), b.unwrap()];
        let assigned = outcomes
            .iter()
            .filter(|o| matches!(o, SlotOutcome::Assigned(_)))
            .count();
        assert_eq!(assigned, 1);

        let rows = store.list_attempt_questions("a1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].question_order, 1);
    }

    #[tokio::test]
    async fn full_attempt_is_a_state_conflict() {
        let store = Arc::new(MemoryStore::new());
        store.insert_attempt_question(&answered("a1", "q1", 1)).await.unwrap();
        let service = AssignmentService::with_retry(store, fast_retry());
        let err = service.reserve("a1", "q2", 1).await.unwrap_err();
        assert_eq!(err.reason(), "attempt_full");
    }

    #[tokio::test]
    async fn slot_conflicts_within_the_budget_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.insert_attempt_question(&answered("a1", "q1", 1)).await.unwrap();
        let faulty = Arc::new(FaultyStore::new(store.clone()));
        faulty.fail("insert_attempt_question", 2);
        let service = AssignmentService::with_retry(faulty.clone(), fast_retry());
        let conflicts_before = ASSIGNMENT_CONFLICTS_TOTAL.get();

        match service.reserve("a1", "q2", 60).await.unwrap() {
            SlotOutcome::Assigned(row) => assert_eq!(row.question_order, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(faulty.remaining("insert_attempt_question"), 0);
        assert!(ASSIGNMENT_CONFLICTS_TOTAL.get() >= conflicts_before + 2);
        assert_eq!(store.list_attempt_questions("a1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_budget_leaves_no_row_and_skips_no_slot() {
        let store = Arc::new(MemoryStore::new());
        store.insert_attempt_question(&answered("a1", "q1", 1)).await.unwrap();
        let faulty = Arc::new(FaultyStore::new(store.clone()));
        faulty.fail("insert_attempt_question", 3);
        let service = AssignmentService::with_retry(faulty.clone(), fast_retry());

        let err = service.reserve("a1", "q2", 60).await.unwrap_err();
        assert_eq!(err.reason(), "assignment_exhausted");
        match err {
            ExamError::AssignmentExhausted { order, attempts } => {
                assert_eq!(order, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.list_attempt_questions("a1").await.unwrap().len(), 1);

        // Once the contention clears, the same slot is taken; nothing was skipped.
        match service.reserve("a1", "q2", 60).await.unwrap() {
            SlotOutcome::Assigned(row) => assert_eq!(row.question_order, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
