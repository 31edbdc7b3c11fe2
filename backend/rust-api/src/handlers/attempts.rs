use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use super::ApiError;
use crate::extractors::{AppJson, OptionalJson};
use crate::middlewares::auth::JwtClaims;
use crate::models::answer::SubmitAnswerRequest;
use crate::models::{AttemptEnvelope, PauseAttemptRequest};
use crate::services::{
    answer_service::AnswerService, attempt_service::AttemptService,
    results_service::ResultsService, selection_service::SelectionService, AppState,
};

pub async fn create_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Creating attempt for user_id={}", claims.sub);

    let (response, created) = AttemptService::new(&state).create(&claims.sub).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

pub async fn list_attempts(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    let response = AttemptService::new(&state).list(&claims.sub).await?;
    Ok(Json(response))
}

pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::debug!("Loading attempt {} for user {}", attempt_id, claims.sub);

    let mut rng = state.request_rng();
    let selection = SelectionService::new(&state);
    let response = AttemptService::new(&state)
        .details(&selection, &claims.sub, &attempt_id, &mut rng)
        .await?;
    Ok(Json(response))
}

pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    AppJson(req): AppJson<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = AnswerService::new(&state)
        .submit_answer(&claims.sub, &attempt_id, &req)
        .await?;
    Ok(Json(response))
}

pub async fn pause_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
    OptionalJson(req): OptionalJson<PauseAttemptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = AttemptService::new(&state)
        .pause(&claims.sub, &attempt_id, req.time_spent_seconds)
        .await?;
    Ok(Json(AttemptEnvelope { attempt }))
}

pub async fn resume_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = AttemptService::new(&state)
        .resume(&claims.sub, &attempt_id)
        .await?;
    Ok(Json(AttemptEnvelope { attempt }))
}

pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let results = ResultsService::new(&state)
        .get_results(&claims.sub, &attempt_id)
        .await?;
    Ok(Json(results))
}

pub async fn fix_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Fix requested for attempt {} by {}", attempt_id, claims.sub);
    let report = AttemptService::new(&state)
        .fix(&claims.sub, &attempt_id)
        .await?;
    Ok(Json(report))
}

pub async fn recover_attempt(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Recover requested for attempt {} by {}", attempt_id, claims.sub);
    let report = AttemptService::new(&state)
        .recover(&claims.sub, &attempt_id)
        .await?;
    Ok(Json(report))
}

pub async fn dev_reset(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    let response = AttemptService::new(&state).reset(&claims.sub).await?;
    Ok(Json(response))
}
