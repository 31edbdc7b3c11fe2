use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ExamError;
use crate::metrics;
use crate::services::AppState;

pub mod attempts;

/// HTTP projection of [`ExamError`]: a status code plus `{reason, message}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Conflict {
        reason: &'static str,
        message: String,
    },
    Unavailable {
        reason: &'static str,
        message: String,
    },
    Internal(String),
}

impl From<ExamError> for ApiError {
    fn from(err: ExamError) -> Self {
        let reason = err.reason();
        match err {
            ExamError::Validation(message) => ApiError::BadRequest(message),
            ExamError::NotFound(message) => ApiError::NotFound(message),
            ExamError::Forbidden(message) => ApiError::Forbidden(message),
            ExamError::StateConflict { reason, message } => ApiError::Conflict { reason, message },
            err @ (ExamError::AssignmentExhausted { .. }
            | ExamError::GenerationFailed(_)
            | ExamError::Store(_)) => ApiError::Unavailable {
                reason,
                message: err.to_string(),
            },
            ExamError::Internal(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "validation_error", message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, "forbidden", message),
            ApiError::Conflict { reason, message } => (StatusCode::CONFLICT, reason, message),
            ApiError::Unavailable { reason, message } => {
                tracing::error!("Request failed ({}): {}", reason, message);
                (StatusCode::SERVICE_UNAVAILABLE, reason, message)
            }
            ApiError::Internal(message) => {
                tracing::error!("Internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "reason": reason, "message": message }))).into_response()
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = serde_json::Map::new();

    let store_health = check_store(&state).await;
    let mut all_healthy = store_health.get("status").and_then(|v| v.as_str()) == Some("healthy");
    dependencies.insert("store".to_string(), json!(store_health));

    let redis_health = check_redis(&state).await;
    if redis_health.get("status").and_then(|v| v.as_str()) == Some("unhealthy") {
        all_healthy = false;
    }
    dependencies.insert("redis".to_string(), json!(redis_health));

    let (status_code, status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "frontend-assessment-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": dependencies
        })),
    )
}

async fn check_store(state: &AppState) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();
    result.insert(
        "backend".to_string(),
        json!(state.config.storage_backend.as_str()),
    );

    match tokio::time::timeout(Duration::from_secs(1), state.store.ping()).await {
        Ok(Ok(())) => {
            result.insert("status".to_string(), json!("healthy"));
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(format!("Store error: {}", e)));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!("Store timeout after 1s"));
        }
    }
    result
}

async fn check_redis(state: &AppState) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();

    let Some(redis) = state.redis.as_ref() else {
        result.insert("status".to_string(), json!("disabled"));
        return result;
    };

    let mut conn = redis.clone();
    match tokio::time::timeout(
        Duration::from_millis(500),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    {
        Ok(Ok(_)) => {
            result.insert("status".to_string(), json!("healthy"));
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(format!("Redis error: {}", e)));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!("Redis timeout after 500ms"));
        }
    }
    result
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// HTTP Basic auth for `/metrics`; credentials come from `METRICS_AUTH` (`user:password`).
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let expected = std::env::var("METRICS_AUTH").unwrap_or_else(|_| "admin:changeme".to_string());
    if credentials != expected {
        tracing::warn!("Rejected /metrics request with bad credentials");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::StoreError;

    fn status_of(err: ExamError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn maps_exam_errors_to_status_codes() {
        assert_eq!(status_of(ExamError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ExamError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ExamError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(ExamError::state_conflict("attempt_not_completed", "x")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ExamError::AssignmentExhausted { order: 3, attempts: 5 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(StoreError::Backend(anyhow::anyhow!("down")).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(ExamError::Internal(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
