use chrono::Utc;
use std::sync::Arc;
use validator::Validate;

use crate::errors::{ExamError, ExamResult};
use crate::metrics::ANSWERS_SUBMITTED_TOTAL;
use crate::models::answer::{AnswerProgress, SubmitAnswerRequest, SubmitAnswerResponse};
use crate::services::attempt_service::{load_owned, settle_progress};
use crate::services::store::{ExamStore, RecordedAnswer};
use crate::services::AppState;

pub struct AnswerService {
    store: Arc<dyn ExamStore>,
}

impl AnswerService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
        }
    }

    /// Scores the answer server-side, records it on its slot and settles the attempt
    /// counters from the answered rows. The response carries progress only.
    pub async fn submit_answer(
        &self,
        user_id: &str,
        attempt_id: &str,
        req: &SubmitAnswerRequest,
    ) -> ExamResult<SubmitAnswerResponse> {
        req.validate()
            .map_err(|e| ExamError::Validation(e.to_string()))?;

        tracing::info!(
            "Processing answer submission: attempt={}, user={}, question={}",
            attempt_id,
            user_id,
            req.question_id
        );

        let attempt = load_owned(self.store.as_ref(), user_id, attempt_id).await?;
        if attempt.is_completed() {
            return Err(ExamError::state_conflict(
                "attempt_not_in_progress",
                "Attempt is already completed",
            ));
        }

        let rows = self.store.list_attempt_questions(&attempt.id).await?;
        let row = rows
            .iter()
            .find(|row| row.question_id == req.question_id)
            .ok_or_else(|| {
                ExamError::state_conflict(
                    "question_not_assigned",
                    format!("Question {} is not part of this attempt", req.question_id),
                )
            })?;
        if row.is_answered() {
            // A retry after a failed counter update lands here; settle before refusing.
            settle_progress(self.store.as_ref(), attempt, &rows).await?;
            return Err(ExamError::state_conflict(
                "question_already_answered",
                format!("Question {} was already answered", req.question_id),
            ));
        }
        // Only the earliest pending slot may be answered.
        if let Some(pending) = rows.iter().find(|r| !r.is_answered()) {
            if pending.question_order != row.question_order {
                return Err(ExamError::state_conflict(
                    "not_current_question",
                    format!(
                        "Question {} is not the current question",
                        req.question_id
                    ),
                ));
            }
        }

        let question = self
            .store
            .get_questions(std::slice::from_ref(&row.question_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ExamError::NotFound(format!("Question {} not found", row.question_id))
            })?;
        let is_correct = question.correct_index == req.user_answer_index;

        let answer = RecordedAnswer {
            answer_index: req.user_answer_index,
            is_correct,
            time_spent_seconds: req.time_spent_seconds,
            answered_at: Utc::now(),
        };
        if !self
            .store
            .record_answer(&attempt.id, row.question_order, &answer)
            .await?
        {
            return Err(ExamError::state_conflict(
                "question_already_answered",
                format!("Question {} was already answered", req.question_id),
            ));
        }

        ANSWERS_SUBMITTED_TOTAL.inc();

        // Counters follow the answered rows, so a failure past this point is repaired
        // by the next submit, details read or fix.
        let rows = self.store.list_attempt_questions(&attempt.id).await?;
        let updated = settle_progress(self.store.as_ref(), attempt, &rows).await?;

        Ok(SubmitAnswerResponse {
            recorded: true,
            progress: AnswerProgress {
                questions_answered: updated.questions_answered,
                total_questions: updated.total_questions,
                is_complete: updated.is_completed(),
            },
        })
    }
}
