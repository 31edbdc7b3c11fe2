mod common;

use chrono::Utc;
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use common::{bank_question, test_config};
use frontend_assessment_api::models::answer::SubmitAnswerRequest;
use frontend_assessment_api::models::question::{BankQuestion, Difficulty};
use frontend_assessment_api::models::{Attempt, AttemptQuestion, AttemptStatus};
use frontend_assessment_api::services::answer_service::AnswerService;
use frontend_assessment_api::services::assignment_service::{AssignmentService, SlotOutcome};
use frontend_assessment_api::services::llm::DisabledProvider;
use frontend_assessment_api::services::store::memory::MemoryStore;
use frontend_assessment_api::services::store::{ExamStore, RecordedAnswer};
use frontend_assessment_api::services::AppState;
use frontend_assessment_api::utils::retry::RetryConfig;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        jitter_max: None,
    }
}

/// Runs `rounds` rounds of `racers` concurrent reservations, answering the winner's
/// slot between rounds, and returns the resulting orders.
async fn race(rounds: usize, racers: usize, total: u32) -> Vec<u32> {
    let store = Arc::new(MemoryStore::new());
    let service = AssignmentService::with_retry(store.clone(), fast_retry());

    for round in 0..rounds {
        let attempts = (0..racers).map(|racer| {
            let question_id = format!("q-{}-{}", round, racer);
            let service = &service;
            async move { service.reserve("attempt", &question_id, total).await }
        });
        let outcomes = join_all(attempts).await;

        let mut winners = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(SlotOutcome::Assigned(row)) => Some(row),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(winners.len() <= 1, "two requests assigned in one round");

        if let Some(row) = winners.pop() {
            let answer = RecordedAnswer {
                answer_index: 0,
                is_correct: false,
                time_spent_seconds: 1,
                answered_at: Utc::now(),
            };
            assert!(store
                .record_answer("attempt", row.question_order, &answer)
                .await
                .unwrap());
        }
    }

    store
        .list_attempt_questions("attempt")
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.question_order)
        .collect()
}

/// Plays a whole attempt: each slot is contested by `racers` reservations and the
/// question that ends up holding it is answered through [`AnswerService`]. Odd orders
/// are answered correctly.
async fn play_to_completion(racers: usize, total: u32) -> (Attempt, Vec<AttemptQuestion>) {
    let store = Arc::new(MemoryStore::new());
    let bank: Vec<BankQuestion> = (1..=total as usize * racers)
        .map(|n| bank_question(n, "JavaScript", "Closures", Difficulty::Easy, false))
        .collect();
    store.seed_questions(bank.clone()).await;
    let mut attempt = Attempt::new("attempt".into(), "user".into(), Utc::now());
    attempt.total_questions = total;
    store.insert_attempt(&attempt).await.unwrap();

    let state = AppState::with_components(
        test_config(),
        store.clone(),
        Arc::new(DisabledProvider),
        Arc::new(DisabledProvider),
    );
    let assignment = AssignmentService::with_retry(store.clone(), fast_retry());
    let answers = AnswerService::new(&state);

    for contenders in bank.chunks(racers) {
        let outcomes = join_all(
            contenders
                .iter()
                .map(|question| assignment.reserve("attempt", &question.id, total)),
        )
        .await;
        let served = outcomes
            .into_iter()
            .find_map(|outcome| match outcome {
                Ok(SlotOutcome::Assigned(row)) | Ok(SlotOutcome::Occupied(row)) => Some(row),
                _ => None,
            })
            .expect("one contender holds the slot");

        let question = bank.iter().find(|q| q.id == served.question_id).unwrap();
        let user_answer_index = if served.question_order % 2 == 1 {
            question.correct_index
        } else {
            (question.correct_index + 1) % 4
        };
        let request = SubmitAnswerRequest {
            question_id: served.question_id.clone(),
            user_answer_index,
            time_spent_seconds: 5,
        };
        answers.submit_answer("user", "attempt", &request).await.unwrap();
    }

    (
        store.get_attempt("attempt").await.unwrap().unwrap(),
        store.list_attempt_questions("attempt").await.unwrap(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn orders_stay_contiguous_under_concurrent_reservations(
        rounds in 1usize..12,
        racers in 1usize..5,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let total = 60;
        let orders = runtime.block_on(race(rounds, racers, total));

        let expected: Vec<u32> = (1..=rounds as u32).collect();
        prop_assert_eq!(orders, expected);
    }

    #[test]
    fn orders_never_exceed_the_total(racers in 1usize..4, total in 1u32..6) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let orders = runtime.block_on(race(total as usize + 2, racers, total));

        prop_assert_eq!(orders.len() as u32, total);
        prop_assert!(orders.iter().all(|order| *order >= 1 && *order <= total));
    }

    #[test]
    fn contested_attempts_complete_with_counters_matching_rows(
        racers in 1usize..4,
        total in 1u32..8,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (attempt, rows) = runtime.block_on(play_to_completion(racers, total));

        prop_assert_eq!(attempt.status, AttemptStatus::Completed);
        prop_assert!(attempt.completed_at.is_some());
        prop_assert_eq!(attempt.questions_answered, total);
        prop_assert_eq!(attempt.correct_count, (total + 1) / 2);
        prop_assert_eq!(rows.len() as u32, total);
        prop_assert!(rows.iter().all(|row| row.is_answered()));
        let orders: Vec<u32> = rows.iter().map(|row| row.question_order).collect();
        prop_assert_eq!(orders, (1..=total).collect::<Vec<u32>>());
    }
}
