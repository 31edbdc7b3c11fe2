mod common;

use axum::http::StatusCode;
use serde_json::json;
use std::collections::HashSet;

use common::{correct_index_of, create_test_app, send, stage_attempt, token_for};
use frontend_assessment_api::models::AttemptStatus;
use frontend_assessment_api::services::store::ExamStore;

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let app = create_test_app().await;

    let (status, body) = send(&app, "POST", "/api/v1/attempts", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "unauthorized");

    let (status, _) = send(&app, "GET", "/api/v1/attempts", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_attempt_is_idempotent() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-create");

    let (status, first) = send(&app, "POST", "/api/v1/attempts", Some(&token), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["total_questions"], 60);
    assert_eq!(first["status"], "in_progress");

    let (status, second) = send(&app, "POST", "/api/v1/attempts", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["attempt_id"], second["attempt_id"]);

    let (status, list) = send(&app, "GET", "/api/v1/attempts", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["attempts"].as_array().unwrap().len(), 1);
    assert!(list["attempts"][0].get("correct_count").is_none());
}

#[tokio::test]
async fn test_answer_loop_serves_contiguous_questions_without_leaking_answers() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-loop");

    let (_, created) = send(&app, "POST", "/api/v1/attempts", Some(&token), None).await;
    let attempt_id = created["attempt_id"].as_str().unwrap().to_string();
    let details_uri = format!("/api/v1/attempts/{}", attempt_id);
    let answers_uri = format!("/api/v1/attempts/{}/answers", attempt_id);

    let mut served = HashSet::new();
    for expected_order in 1..=6u64 {
        let (status, details) = send(&app, "GET", &details_uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let question = &details["next_question"];
        assert_eq!(question["question_order"], expected_order);
        assert_eq!(question["options"].as_array().unwrap().len(), 4);
        assert!(question.get("correct_index").is_none());
        assert!(question.get("explanation").is_none());

        let question_id = question["id"].as_str().unwrap().to_string();
        assert!(served.insert(question_id.clone()), "question served twice");

        // Re-reading without answering serves the same pending slot.
        let (_, again) = send(&app, "GET", &details_uri, Some(&token), None).await;
        assert_eq!(again["next_question"]["id"], question_id.as_str());

        let (status, answer) = send(
            &app,
            "POST",
            &answers_uri,
            Some(&token),
            Some(json!({
                "question_id": question_id,
                "user_answer_index": 0,
                "time_spent_seconds": 30
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["recorded"], true);
        assert_eq!(answer["progress"]["questions_answered"], expected_order);
        assert_eq!(answer["progress"]["is_complete"], false);
        assert!(answer.get("is_correct").is_none());
        assert!(answer.get("correct_index").is_none());
        assert!(answer["progress"].get("is_correct").is_none());
    }

    let rows = app.store.list_attempt_questions(&attempt_id).await.unwrap();
    let orders: Vec<u32> = rows.iter().map(|r| r.question_order).collect();
    assert_eq!(orders, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_last_answer_completes_attempt_and_unlocks_results() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-finish");
    stage_attempt(&app, "attempt-finish", "user-finish", 59, AttemptStatus::InProgress).await;

    let (status, details) = send(
        &app,
        "GET",
        "/api/v1/attempts/attempt-finish",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["next_question"]["question_order"], 60);
    let question_id = details["next_question"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "GET",
        "/api/v1/attempts/attempt-finish/results",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let correct = correct_index_of(&app, &question_id).await;
    let (status, answer) = send(
        &app,
        "POST",
        "/api/v1/attempts/attempt-finish/answers",
        Some(&token),
        Some(json!({
            "question_id": question_id,
            "user_answer_index": correct,
            "time_spent_seconds": 12
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answer["progress"]["questions_answered"], 60);
    assert_eq!(answer["progress"]["is_complete"], true);

    let (_, details) = send(
        &app,
        "GET",
        "/api/v1/attempts/attempt-finish",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(details["attempt"]["status"], "completed");
    assert!(details["next_question"].is_null());

    let (status, results) = send(
        &app,
        "GET",
        "/api/v1/attempts/attempt-finish/results",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results["summary"]["total_questions"], 60);
    assert_eq!(results["summary"]["answered"], 60);
    // 40 of the staged 59 are correct, plus the final one.
    assert_eq!(results["summary"]["correct"], 41);
    assert_eq!(results["review"].as_array().unwrap().len(), 60);
    assert_eq!(results["review"][59]["is_correct"], true);
    assert!(!results["by_topic"].as_array().unwrap().is_empty());

    let (status, rejected) = send(
        &app,
        "POST",
        "/api/v1/attempts/attempt-finish/answers",
        Some(&token),
        Some(json!({ "question_id": question_id, "user_answer_index": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(rejected["reason"], "attempt_not_in_progress");
}

#[tokio::test]
async fn test_results_refused_while_in_progress() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-early");
    stage_attempt(&app, "attempt-early", "user-early", 10, AttemptStatus::InProgress).await;

    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/attempts/attempt-early/results",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "attempt_not_completed");
}

#[tokio::test]
async fn test_foreign_and_missing_attempts() {
    let app = create_test_app().await;
    stage_attempt(&app, "attempt-owned", "owner", 3, AttemptStatus::InProgress).await;
    let intruder = token_for(&app.config, "intruder");

    let (status, body) = send(
        &app,
        "GET",
        "/api/v1/attempts/attempt-owned",
        Some(&intruder),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "forbidden");

    let (status, _) = send(&app, "GET", "/api/v1/attempts/nope", Some(&intruder), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_answers_are_rejected() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-invalid");
    let (_, created) = send(&app, "POST", "/api/v1/attempts", Some(&token), None).await;
    let attempt_id = created["attempt_id"].as_str().unwrap();
    let (_, details) = send(
        &app,
        "GET",
        &format!("/api/v1/attempts/{}", attempt_id),
        Some(&token),
        None,
    )
    .await;
    let question_id = details["next_question"]["id"].as_str().unwrap();
    let uri = format!("/api/v1/attempts/{}/answers", attempt_id);

    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(&token),
        Some(json!({ "question_id": question_id, "user_answer_index": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "validation_error");

    let (status, _) = send(
        &app,
        "POST",
        &uri,
        Some(&token),
        Some(json!({ "user_answer_index": "one" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(&token),
        Some(json!({ "question_id": "bank-999", "user_answer_index": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "question_not_assigned");
}

#[tokio::test]
async fn test_pause_and_resume_update_session_metadata() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-pause");
    let (_, created) = send(&app, "POST", "/api/v1/attempts", Some(&token), None).await;
    let attempt_id = created["attempt_id"].as_str().unwrap();

    let (status, paused) = send(
        &app,
        "POST",
        &format!("/api/v1/attempts/{}/pause", attempt_id),
        Some(&token),
        Some(json!({ "time_spent_seconds": 120 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["attempt"]["status"], "in_progress");
    assert_eq!(paused["attempt"]["metadata"]["pause_count"], 1);
    assert_eq!(paused["attempt"]["metadata"]["time_spent_seconds"], 120);

    // Empty body is accepted.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/attempts/{}/pause", attempt_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, resumed) = send(
        &app,
        "POST",
        &format!("/api/v1/attempts/{}/resume", attempt_id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["attempt"]["metadata"]["session_count"], 2);
    assert_eq!(resumed["attempt"]["metadata"]["pause_count"], 2);
}

#[tokio::test]
async fn test_concurrent_detail_requests_assign_one_slot() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-race");
    stage_attempt(&app, "attempt-race", "user-race", 4, AttemptStatus::InProgress).await;

    let uri = "/api/v1/attempts/attempt-race";
    let (first, second) = tokio::join!(
        send(&app, "GET", uri, Some(&token), None),
        send(&app, "GET", uri, Some(&token), None)
    );
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    assert_eq!(first.1["next_question"]["question_order"], 5);
    assert_eq!(
        first.1["next_question"]["id"],
        second.1["next_question"]["id"]
    );

    let rows = app.store.list_attempt_questions("attempt-race").await.unwrap();
    assert_eq!(rows.len(), 5);
    let orders: HashSet<u32> = rows.iter().map(|r| r.question_order).collect();
    assert_eq!(orders.len(), 5);
}

#[tokio::test]
async fn test_dev_reset_clears_attempts() {
    let app = create_test_app().await;
    let token = token_for(&app.config, "user-reset");
    send(&app, "POST", "/api/v1/attempts", Some(&token), None).await;

    let (status, body) = send(&app, "POST", "/api/v1/attempts/dev/reset", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted_attempts"], 1);

    let (_, list) = send(&app, "GET", "/api/v1/attempts", Some(&token), None).await;
    assert!(list["attempts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let app = create_test_app().await;

    let (status, health) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["dependencies"]["store"]["backend"], "memory");
    assert_eq!(health["dependencies"]["redis"]["status"], "disabled");

    let (status, _) = send(&app, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
