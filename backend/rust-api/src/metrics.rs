use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, CounterVec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Store Metrics
    pub static ref DB_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "db_operations_total",
        "Total number of database operations",
        &["operation", "collection", "status"]
    )
    .unwrap();

    pub static ref DB_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "db_operation_duration_seconds",
        "Database operation duration in seconds",
        &["operation", "collection"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Cache Metrics (Redis ontology cache)
    pub static ref CACHE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_operations_total",
        "Total number of cache operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref CACHE_HIT_RATIO: CounterVec = register_counter_vec!(
        "cache_hit_ratio",
        "Cache hit/miss ratio",
        &["result"]
    )
    .unwrap();

    // Exam Metrics
    pub static ref ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempts_total",
        "Attempt lifecycle transitions",
        &["status"]
    )
    .unwrap();

    pub static ref ATTEMPTS_IN_PROGRESS: IntGauge = register_int_gauge!(
        "attempts_in_progress",
        "Attempts started but not yet completed by this process"
    )
    .unwrap();

    pub static ref ANSWERS_SUBMITTED_TOTAL: IntCounter = register_int_counter!(
        "answers_submitted_total",
        "Total number of answers recorded"
    )
    .unwrap();

    pub static ref QUESTIONS_ASSIGNED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "questions_assigned_total",
        "Questions bound to attempt slots, by origin",
        &["source"]
    )
    .unwrap();

    pub static ref ASSIGNMENT_CONFLICTS_TOTAL: IntCounter = register_int_counter!(
        "assignment_conflicts_total",
        "Slot reservations that lost a uniqueness race"
    )
    .unwrap();

    pub static ref SELECTION_FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "selection_fallbacks_total",
        "Deterministic fallbacks taken by the selection pipeline",
        &["component"]
    )
    .unwrap();

    pub static ref LLM_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "llm_request_duration_seconds",
        "Language-model and embedding request duration in seconds",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]
    )
    .unwrap();

    pub static ref INTEGRITY_REPAIRS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "integrity_repairs_total",
        "Fix and recover invocations by outcome",
        &["operation", "outcome"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track database operation with metrics
pub async fn track_db_operation<F, T, E>(operation: &str, collection: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    DB_OPERATIONS_TOTAL
        .with_label_values(&[operation, collection, status])
        .inc();

    DB_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, collection])
        .observe(duration);

    result
}

/// Helper: time one provider call
pub async fn track_llm_operation<F, T, E>(operation: &str, future: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    LLM_REQUEST_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(start.elapsed().as_secs_f64());
    result
}

pub fn record_cache_operation(operation: &str, ok: bool) {
    let status = if ok { "success" } else { "error" };
    CACHE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Record cache hit
pub fn record_cache_hit() {
    CACHE_HIT_RATIO.with_label_values(&["hit"]).inc();
}

/// Record cache miss
pub fn record_cache_miss() {
    CACHE_HIT_RATIO.with_label_values(&["miss"]).inc();
}

pub fn record_fallback(component: &str) {
    SELECTION_FALLBACKS_TOTAL
        .with_label_values(&[component])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .get();
        let _ = QUESTIONS_ASSIGNED_TOTAL.with_label_values(&["bank"]).get();
    }

    #[test]
    fn test_render_metrics() {
        ATTEMPTS_TOTAL.with_label_values(&["created"]).inc();
        record_fallback("criteria");

        let output = render_metrics().unwrap();
        assert!(output.contains("attempts_total"));
        assert!(output.contains("selection_fallbacks_total"));
    }

    #[tokio::test]
    async fn track_db_operation_passes_results_through() {
        let ok: Result<u32, anyhow::Error> =
            track_db_operation("find", "attempts", async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);
    }
}
