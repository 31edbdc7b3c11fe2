use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod errors;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest(
            "/api/v1/attempts",
            attempt_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn attempt_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/",
            post(handlers::attempts::create_attempt).get(handlers::attempts::list_attempts),
        )
        .route("/dev/reset", post(handlers::attempts::dev_reset))
        .route("/{id}", get(handlers::attempts::get_attempt))
        .route("/{id}/answers", post(handlers::attempts::submit_answer))
        .route("/{id}/pause", post(handlers::attempts::pause_attempt))
        .route("/{id}/resume", post(handlers::attempts::resume_attempt))
        .route("/{id}/results", get(handlers::attempts::get_results))
        .route("/{id}/fix", post(handlers::attempts::fix_attempt))
        .route("/{id}/recover", post(handlers::attempts::recover_attempt))
}
