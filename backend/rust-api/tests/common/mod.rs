#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use frontend_assessment_api::{
    config::Config,
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::question::{content_key, BankQuestion, BloomLevel, Citation, Difficulty},
    models::{Attempt, AttemptQuestion, AttemptStatus},
    services::llm::DisabledProvider,
    services::ontology_service::fallback_topics,
    services::store::memory::MemoryStore,
    services::store::ExamStore,
    services::AppState,
};

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub config: Config,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.exam.rng_seed = Some(42);
    config.exam.dev_reset_enabled = true;
    config
}

/// Router over an in-memory store seeded with the full test bank; model calls disabled.
pub async fn create_test_app() -> TestApp {
    create_test_app_with_bank(test_bank()).await
}

pub async fn create_test_app_with_bank(bank: Vec<BankQuestion>) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(MemoryStore::new());
    store.seed_questions(bank).await;

    let config = test_config();
    let state = AppState::with_components(
        config.clone(),
        store.clone(),
        Arc::new(DisabledProvider),
        Arc::new(DisabledProvider),
    );

    TestApp {
        router: create_router(Arc::new(state)),
        store,
        config,
    }
}

/// One question per (topic, subtopic, difficulty, coding) combination of the
/// built-in ontology, with texts that share few words.
pub fn test_bank() -> Vec<BankQuestion> {
    let mut bank = Vec::new();
    let mut n = 0usize;
    for entry in fallback_topics() {
        for subtopic in &entry.subtopics {
            for difficulty in Difficulty::ALL {
                for coding in [false, true] {
                    n += 1;
                    bank.push(bank_question(n, &entry.topic, subtopic, difficulty, coding));
                }
            }
        }
    }
    bank
}

pub fn bank_question(
    n: usize,
    topic: &str,
    subtopic: &str,
    difficulty: Difficulty,
    coding: bool,
) -> BankQuestion {
    let question = format!(
        "{} {}: alpha{n} beta{n} gamma{n} delta{n} epsilon{n} zeta{n}?",
        topic, subtopic
    );
    let options: Vec<String> = (0..4).map(|i| format!("Option {} of item {}", i, n)).collect();
    BankQuestion {
        id: format!("bank-{:03}", n),
        topic: topic.to_string(),
        subtopic: Some(subtopic.to_string()),
        difficulty,
        bloom_level: BloomLevel::ALL[n % BloomLevel::ALL.len()],
        code: if coding {
            Some(format!(
                "const value{n} = {n};\nconsole.log(value{n});\nexport default value{n};"
            ))
        } else {
            None
        },
        content_key: content_key(&question, &options),
        question,
        options,
        correct_index: (n % 4) as u8,
        explanation: format!("Explanation for item {}", n),
        citations: vec![Citation {
            source: format!("MDN: {}", subtopic),
            url: Some("https://developer.mozilla.org/".to_string()),
            excerpt: None,
        }],
        embedding: vec![],
        review: None,
        created_at: Utc::now(),
    }
}

pub fn token_for(config: &Config, user_id: &str) -> String {
    JwtService::new(&config.jwt_secret)
        .generate_token(&JwtClaims::for_user(user_id, 3600))
        .unwrap()
}

/// Sends one request through the router and decodes the JSON body (or `Null`).
pub async fn send(
    app: &TestApp,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

pub async fn correct_index_of(app: &TestApp, question_id: &str) -> u8 {
    app.store
        .get_questions(&[question_id.to_string()])
        .await
        .unwrap()
        .first()
        .map(|q| q.correct_index)
        .unwrap()
}

/// Stages an attempt directly in the store with `answered` answered slots taken
/// from the front of the bank.
pub async fn stage_attempt(
    app: &TestApp,
    attempt_id: &str,
    user_id: &str,
    answered: u32,
    status: AttemptStatus,
) -> Attempt {
    let bank = test_bank();
    let mut attempt = Attempt::new(attempt_id.to_string(), user_id.to_string(), Utc::now());
    attempt.status = status;
    attempt.questions_answered = answered;

    let mut correct = 0;
    for order in 1..=answered {
        let question = &bank[(order - 1) as usize];
        let mut row = AttemptQuestion::new(attempt_id, &question.id, order);
        let is_correct = order % 3 != 0;
        row.user_answer_index = Some(if is_correct {
            question.correct_index
        } else {
            (question.correct_index + 1) % 4
        });
        row.is_correct = Some(is_correct);
        row.answered_at = Some(Utc::now());
        if is_correct {
            correct += 1;
        }
        app.store.insert_attempt_question(&row).await.unwrap();
    }
    attempt.correct_count = correct;
    if status == AttemptStatus::Completed {
        attempt.completed_at = Some(Utc::now());
    }
    app.store.put_attempt(attempt.clone()).await;
    attempt
}
