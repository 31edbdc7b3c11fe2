//! Attempt lifecycle: create, read with next question, pause/resume, history,
//! development reset, and the two integrity repairs (fix and recover).

use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ExamError, ExamResult};
use crate::metrics::{ATTEMPTS_IN_PROGRESS, ATTEMPTS_TOTAL, INTEGRITY_REPAIRS_TOTAL, QUESTIONS_ASSIGNED_TOTAL};
use crate::models::recovery::{BackfillResult, FixReport, RecoverReport};
use crate::models::{
    Attempt, AttemptDetailsResponse, AttemptListResponse, AttemptQuestion, AttemptStatus,
    AttemptView, CreateAttemptResponse, ResetResponse,
};
use crate::services::assignment_service::AssignmentService;
use crate::services::selection_service::SelectionService;
use crate::services::store::{ExamStore, ProgressReset};
use crate::services::AppState;

pub struct AttemptService {
    store: Arc<dyn ExamStore>,
    assignment: AssignmentService,
    dev_reset_enabled: bool,
}

impl AttemptService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
            assignment: AssignmentService::new(state.store.clone()),
            dev_reset_enabled: state.config.exam.dev_reset_enabled,
        }
    }

    /// Loads an attempt and checks that `user_id` owns it.
    pub async fn load_owned(&self, user_id: &str, attempt_id: &str) -> ExamResult<Attempt> {
        load_owned(self.store.as_ref(), user_id, attempt_id).await
    }

    /// Starts a new attempt, or returns the caller's running one. The flag is true
    /// when a new attempt was created.
    pub async fn create(&self, user_id: &str) -> ExamResult<(CreateAttemptResponse, bool)> {
        if let Some(existing) = self.store.find_in_progress_attempt(user_id).await? {
            tracing::info!(
                "User {} already has attempt {} in progress",
                user_id,
                existing.id
            );
            return Ok((create_response(&existing), false));
        }

        let attempt = Attempt::new(Uuid::new_v4().to_string(), user_id.to_string(), Utc::now());
        match self.store.insert_attempt(&attempt).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                // A concurrent create landed between the lookup and the insert.
                let running = self
                    .store
                    .find_in_progress_attempt(user_id)
                    .await?
                    .ok_or(ExamError::Store(e))?;
                tracing::info!(
                    "Concurrent create for user {} resolved to attempt {}",
                    user_id,
                    running.id
                );
                return Ok((create_response(&running), false));
            }
            Err(e) => return Err(e.into()),
        }

        ATTEMPTS_TOTAL.with_label_values(&["created"]).inc();
        ATTEMPTS_IN_PROGRESS.inc();
        tracing::info!("Attempt created: id={}, user={}", attempt.id, user_id);

        Ok((create_response(&attempt), true))
    }

    pub async fn details<R: Rng + Send + ?Sized>(
        &self,
        selection: &SelectionService,
        user_id: &str,
        attempt_id: &str,
        rng: &mut R,
    ) -> ExamResult<AttemptDetailsResponse> {
        let mut attempt = self.load_owned(user_id, attempt_id).await?;
        if !attempt.is_completed() {
            let rows = self.store.list_attempt_questions(&attempt.id).await?;
            attempt = settle_progress(self.store.as_ref(), attempt, &rows).await?;
        }
        let next_question = if attempt.is_completed() {
            None
        } else {
            selection.next_question(&attempt, rng).await?
        };
        Ok(AttemptDetailsResponse {
            attempt: attempt.view(),
            next_question,
        })
    }

    pub async fn list(&self, user_id: &str) -> ExamResult<AttemptListResponse> {
        let attempts = self.store.list_attempts(user_id).await?;
        Ok(AttemptListResponse {
            attempts: attempts.iter().map(Attempt::view).collect(),
        })
    }

    /// Session bookkeeping only; status is untouched.
    pub async fn pause(
        &self,
        user_id: &str,
        attempt_id: &str,
        time_spent_seconds: Option<u32>,
    ) -> ExamResult<AttemptView> {
        let mut attempt = self.load_in_progress(user_id, attempt_id).await?;
        let metadata = &mut attempt.metadata;
        metadata.pause_count += 1;
        metadata.last_session_at = Some(Utc::now());
        metadata.time_spent_seconds += time_spent_seconds.unwrap_or(0) as u64;

        self.store.update_metadata(&attempt.id, &attempt.metadata).await?;
        tracing::info!(
            "Attempt {} paused (pause_count={})",
            attempt.id,
            attempt.metadata.pause_count
        );
        Ok(attempt.view())
    }

    pub async fn resume(&self, user_id: &str, attempt_id: &str) -> ExamResult<AttemptView> {
        let mut attempt = self.load_in_progress(user_id, attempt_id).await?;
        attempt.metadata.session_count += 1;
        attempt.metadata.last_session_at = Some(Utc::now());

        self.store.update_metadata(&attempt.id, &attempt.metadata).await?;
        tracing::info!(
            "Attempt {} resumed (session_count={})",
            attempt.id,
            attempt.metadata.session_count
        );
        Ok(attempt.view())
    }

    /// Counter repair. A completed attempt with fewer rows than questions goes back to
    /// `in_progress`. A running attempt whose counters disagree with its answered rows
    /// gets them rewritten, and completes once every slot is answered. Counters are
    /// always tallied from answered rows; pending slots count for nothing.
    pub async fn fix(&self, user_id: &str, attempt_id: &str) -> ExamResult<FixReport> {
        let attempt = self.load_owned(user_id, attempt_id).await?;
        let rows = self.store.list_attempt_questions(&attempt.id).await?;
        let actual = rows.len() as u32;
        let tally = Tally::of(&rows);

        let mut report = FixReport {
            attempt_id: attempt.id.clone(),
            fixed: false,
            previous_status: attempt.status,
            status: attempt.status,
            expected_questions: attempt.total_questions,
            actual_questions: actual,
            questions_answered: attempt.questions_answered,
            message: String::new(),
        };

        let reset = match attempt.status {
            AttemptStatus::Completed if actual < attempt.total_questions => {
                tracing::warn!(
                    "Attempt {} completed with {} of {} rows; reopening",
                    attempt.id,
                    actual,
                    attempt.total_questions
                );
                ProgressReset {
                    status: AttemptStatus::InProgress,
                    questions_answered: tally.answered,
                    correct_count: tally.correct,
                    completed_at: None,
                }
            }
            AttemptStatus::InProgress
                if !tally.matches(&attempt) || tally.answered >= attempt.total_questions =>
            {
                let finished = tally.answered >= attempt.total_questions;
                tracing::warn!(
                    "Attempt {} counters {}/{} disagree with {}/{} answered rows; rewriting",
                    attempt.id,
                    attempt.questions_answered,
                    attempt.correct_count,
                    tally.answered,
                    tally.correct
                );
                ProgressReset {
                    status: if finished {
                        AttemptStatus::Completed
                    } else {
                        AttemptStatus::InProgress
                    },
                    questions_answered: tally.answered,
                    correct_count: tally.correct,
                    completed_at: finished.then(Utc::now),
                }
            }
            AttemptStatus::Completed => {
                report.message = format!(
                    "Attempt has all {} questions assigned",
                    attempt.total_questions
                );
                INTEGRITY_REPAIRS_TOTAL
                    .with_label_values(&["fix", "noop"])
                    .inc();
                return Ok(report);
            }
            AttemptStatus::InProgress => {
                report.message = "Attempt counters match its answered questions".to_string();
                INTEGRITY_REPAIRS_TOTAL
                    .with_label_values(&["fix", "noop"])
                    .inc();
                return Ok(report);
            }
        };

        self.apply_reset(&attempt, &reset, "fixed").await?;
        INTEGRITY_REPAIRS_TOTAL
            .with_label_values(&["fix", "repaired"])
            .inc();

        report.fixed = true;
        report.status = reset.status;
        report.questions_answered = reset.questions_answered;
        report.message = match (attempt.status, reset.status) {
            (AttemptStatus::Completed, _) => format!(
                "Reopened attempt: {} of {} questions assigned",
                actual, attempt.total_questions
            ),
            (_, AttemptStatus::Completed) => format!(
                "Completed attempt: all {} questions answered",
                attempt.total_questions
            ),
            _ => format!(
                "Counters set to {} answered, {} correct",
                tally.answered, tally.correct
            ),
        };
        Ok(report)
    }

    /// Sequence repair: backfills every missing order of a completed attempt.
    /// Status flips back to `in_progress` only when every backfill landed.
    pub async fn recover(&self, user_id: &str, attempt_id: &str) -> ExamResult<RecoverReport> {
        let attempt = self.load_owned(user_id, attempt_id).await?;
        if !attempt.is_completed() {
            return Err(ExamError::state_conflict(
                "attempt_not_completed",
                "Only completed attempts can be recovered",
            ));
        }

        let rows = self.store.list_attempt_questions(&attempt.id).await?;
        let present: HashSet<u32> = rows.iter().map(|row| row.question_order).collect();
        let missing_orders: Vec<u32> = (1..=attempt.total_questions)
            .filter(|order| !present.contains(order))
            .collect();

        if missing_orders.is_empty() {
            INTEGRITY_REPAIRS_TOTAL
                .with_label_values(&["recover", "noop"])
                .inc();
            return Ok(RecoverReport {
                attempt_id: attempt.id.clone(),
                recovered: false,
                status: attempt.status,
                missing_orders,
                results: Vec::new(),
                message: "No missing question orders".to_string(),
            });
        }

        tracing::warn!(
            "Attempt {} is missing {} orders; backfilling",
            attempt.id,
            missing_orders.len()
        );

        let mut used: Vec<String> = rows.iter().map(|row| row.question_id.clone()).collect();
        let mut results = Vec::with_capacity(missing_orders.len());
        for &order in &missing_orders {
            let result = self.backfill(&attempt.id, order, &mut used).await;
            if !result.success {
                tracing::warn!(
                    "Backfill of slot {} for attempt {} failed: {}",
                    order,
                    attempt.id,
                    result.error.as_deref().unwrap_or("unknown")
                );
            }
            results.push(result);
        }

        let all_succeeded = results.iter().all(|r| r.success);
        if !all_succeeded {
            let failed = results.iter().filter(|r| !r.success).count();
            INTEGRITY_REPAIRS_TOTAL
                .with_label_values(&["recover", "partial"])
                .inc();
            return Ok(RecoverReport {
                attempt_id: attempt.id.clone(),
                recovered: false,
                status: attempt.status,
                missing_orders,
                results,
                message: format!("{} backfills failed; status left unchanged", failed),
            });
        }

        let tally = Tally::of(&rows);
        let reset = ProgressReset {
            status: AttemptStatus::InProgress,
            questions_answered: tally.answered,
            correct_count: tally.correct,
            completed_at: None,
        };
        self.apply_reset(&attempt, &reset, "recovered").await?;

        INTEGRITY_REPAIRS_TOTAL
            .with_label_values(&["recover", "repaired"])
            .inc();
        tracing::info!(
            "Attempt {} recovered: {} slots backfilled",
            attempt.id,
            missing_orders.len()
        );

        Ok(RecoverReport {
            attempt_id: attempt.id.clone(),
            recovered: true,
            status: AttemptStatus::InProgress,
            message: format!("Backfilled {} missing questions", missing_orders.len()),
            missing_orders,
            results,
        })
    }

    /// Writes `reset` if the attempt still has the status it was read with, and keeps
    /// the lifecycle gauges in step with the status change.
    async fn apply_reset(
        &self,
        attempt: &Attempt,
        reset: &ProgressReset,
        action: &str,
    ) -> ExamResult<()> {
        let applied = match self
            .store
            .reset_progress(&attempt.id, attempt.status, reset)
            .await
        {
            Ok(applied) => applied,
            Err(e) if e.is_conflict() => {
                return Err(ExamError::state_conflict(
                    "attempt_in_progress_exists",
                    format!(
                        "Attempt {} cannot reopen while another attempt is in progress",
                        attempt.id
                    ),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        if !applied {
            return Err(ExamError::state_conflict(
                "attempt_changed",
                format!("Attempt changed while it was being {}", action),
            ));
        }

        match (attempt.status, reset.status) {
            (AttemptStatus::Completed, AttemptStatus::InProgress) => ATTEMPTS_IN_PROGRESS.inc(),
            (AttemptStatus::InProgress, AttemptStatus::Completed) => {
                ATTEMPTS_IN_PROGRESS.dec();
                ATTEMPTS_TOTAL.with_label_values(&["completed"]).inc();
            }
            _ => {}
        }
        Ok(())
    }

    /// Any unused bank question at the exact order; no criteria pipeline.
    async fn backfill(&self, attempt_id: &str, order: u32, used: &mut Vec<String>) -> BackfillResult {
        let failure = |error: String| BackfillResult {
            question_order: order,
            success: false,
            question_id: None,
            error: Some(error),
        };

        let question = match self.store.any_question_excluding(used).await {
            Ok(Some(question)) => question,
            Ok(None) => return failure("No unused question left in the bank".to_string()),
            Err(e) => return failure(e.to_string()),
        };

        match self
            .assignment
            .insert_exact(attempt_id, &question.id, order)
            .await
        {
            Ok(row) => {
                QUESTIONS_ASSIGNED_TOTAL.with_label_values(&["backfill"]).inc();
                used.push(row.question_id.clone());
                BackfillResult {
                    question_order: order,
                    success: true,
                    question_id: Some(row.question_id),
                    error: None,
                }
            }
            Err(e) => failure(e.to_string()),
        }
    }

    pub async fn reset(&self, user_id: &str) -> ExamResult<ResetResponse> {
        if !self.dev_reset_enabled {
            return Err(ExamError::Forbidden(
                "Attempt reset is disabled in this environment".to_string(),
            ));
        }
        let in_progress = self.store.find_in_progress_attempt(user_id).await?.is_some();
        let deleted_attempts = self.store.delete_attempts_for_user(user_id).await?;
        if in_progress {
            ATTEMPTS_IN_PROGRESS.dec();
        }
        tracing::warn!("Dev reset: deleted {} attempts of user {}", deleted_attempts, user_id);
        Ok(ResetResponse { deleted_attempts })
    }

    async fn load_in_progress(&self, user_id: &str, attempt_id: &str) -> ExamResult<Attempt> {
        let attempt = self.load_owned(user_id, attempt_id).await?;
        if attempt.is_completed() {
            return Err(ExamError::state_conflict(
                "attempt_not_in_progress",
                "Attempt is already completed",
            ));
        }
        Ok(attempt)
    }
}

pub(crate) async fn load_owned(
    store: &dyn ExamStore,
    user_id: &str,
    attempt_id: &str,
) -> ExamResult<Attempt> {
    let attempt = store
        .get_attempt(attempt_id)
        .await?
        .ok_or_else(|| ExamError::NotFound(format!("Attempt {} not found", attempt_id)))?;
    if attempt.user_id != user_id {
        return Err(ExamError::Forbidden(
            "Attempt belongs to another user".to_string(),
        ));
    }
    Ok(attempt)
}

/// Answered and correct counts tallied from an attempt's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tally {
    pub answered: u32,
    pub correct: u32,
}

impl Tally {
    pub fn of(rows: &[AttemptQuestion]) -> Self {
        Self {
            answered: rows.iter().filter(|row| row.is_answered()).count() as u32,
            correct: rows
                .iter()
                .filter(|row| row.is_correct == Some(true))
                .count() as u32,
        }
    }

    fn matches(&self, attempt: &Attempt) -> bool {
        self.answered == attempt.questions_answered && self.correct == attempt.correct_count
    }
}

/// Brings a running attempt's counters up to its answered rows and completes it when
/// every slot is answered. Safe to repeat: each write is conditional, so a call
/// after a partial failure finishes what the earlier one started.
pub(crate) async fn settle_progress(
    store: &dyn ExamStore,
    attempt: Attempt,
    rows: &[AttemptQuestion],
) -> ExamResult<Attempt> {
    if attempt.is_completed() {
        return Ok(attempt);
    }
    let tally = Tally::of(rows);
    let mut attempt = attempt;

    if tally.answered > attempt.questions_answered {
        attempt = match store
            .advance_progress(&attempt.id, tally.answered, tally.correct)
            .await?
        {
            Some(advanced) => advanced,
            None => reload(store, &attempt.id).await?,
        };
    }

    if !attempt.is_completed()
        && tally.answered >= attempt.total_questions
        && attempt.questions_answered >= attempt.total_questions
    {
        if store.mark_completed(&attempt.id, Utc::now()).await? {
            ATTEMPTS_TOTAL.with_label_values(&["completed"]).inc();
            ATTEMPTS_IN_PROGRESS.dec();
            tracing::info!(
                "Attempt {} completed with {}/{} correct",
                attempt.id,
                attempt.correct_count,
                attempt.total_questions
            );
        }
        attempt = reload(store, &attempt.id).await?;
    }
    Ok(attempt)
}

async fn reload(store: &dyn ExamStore, attempt_id: &str) -> ExamResult<Attempt> {
    store
        .get_attempt(attempt_id)
        .await?
        .ok_or_else(|| ExamError::NotFound(format!("Attempt {} not found", attempt_id)))
}

fn create_response(attempt: &Attempt) -> CreateAttemptResponse {
    CreateAttemptResponse {
        attempt_id: attempt.id.clone(),
        total_questions: attempt.total_questions,
        status: attempt.status,
    }
}
