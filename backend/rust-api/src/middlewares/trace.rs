use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Clone, Debug)]
pub struct RequestTraceContext {
    pub trace_id: String,
}

fn incoming_trace_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
}

/// Propagates or mints `x-trace-id`, exposes it to handlers and runs the request
/// inside a span carrying it.
pub async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = incoming_trace_id(&request).unwrap_or_else(|| Uuid::new_v4().to_string());
    let header = HeaderName::from_static(TRACE_ID_HEADER);
    let value = HeaderValue::from_str(&trace_id).ok();

    request.extensions_mut().insert(RequestTraceContext {
        trace_id: trace_id.clone(),
    });
    if let Some(value) = value.clone() {
        request.headers_mut().insert(header.clone(), value);
    }

    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path()
    );
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = value {
        response.headers_mut().entry(header).or_insert(value);
    }
    response
}
