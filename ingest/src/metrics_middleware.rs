use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::{MatchedPath, Request},
    middleware::Next,
    response::IntoResponse,
    routing::Router,
};
use metrics::gauge;

use crate::api::IngestError;

// Global atomic counter for active connections
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

// Guard to ensure connection count is decremented even on panic
struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let connections = ACTIVE_CONNECTIONS
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        gauge!(METRIC_INGEST_ACTIVE_CONNECTIONS).set(connections as f64);
    }
}

const METRIC_INGEST_ACTIVE_CONNECTIONS: &str = "ingest_active_connections";
const METRIC_HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
const METRIC_HTTP_REQUESTS_DURATION_SECONDS: &str = "http_requests_duration_seconds";
const METRIC_INGEST_REQUEST_TIMED_OUT: &str = "middleware_request_timed_out_total";

/// Middleware to record some common HTTP metrics
/// Someday tower-http might provide a metrics middleware: https://github.com/tower-rs/tower-http/issues/57
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let connections = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    gauge!(METRIC_INGEST_ACTIVE_CONNECTIONS).set(connections as f64);
    let _guard = ConnectionGuard;

    // Run the rest of the request handling first, so we can measure it and
    // get response codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!(METRIC_HTTP_REQUESTS_TOTAL, &labels).increment(1);
    metrics::histogram!(METRIC_HTTP_REQUESTS_DURATION_SECONDS, &labels).record(latency);

    response
}

/// Bounds end-to-end request handling. Requests that blow the deadline get
/// the standard error body with a retryable status, so SDKs hold on to
/// their events and try again.
pub fn apply_request_timeout<S>(
    router: Router<S>,
    request_timeout_seconds: Option<u64>,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let Some(request_timeout_seconds) = request_timeout_seconds else {
        tracing::info!("no request timeout middleware applied");
        return router;
    };

    let timeout_duration = Duration::from_secs(request_timeout_seconds);
    tracing::info!(
        "applying request timeout middleware with duration: {:?}",
        timeout_duration
    );

    router.layer(axum::middleware::from_fn(
        move |req: axum::extract::Request, next: axum::middleware::Next| async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();

            match tokio::time::timeout(timeout_duration, next.run(req)).await {
                Ok(response) => response,
                Err(_) => {
                    let tags = [("method", method.clone()), ("path", path.clone())];
                    metrics::counter!(METRIC_INGEST_REQUEST_TIMED_OUT, &tags).increment(1);

                    tracing::warn!(
                        method = method,
                        path = path,
                        timeout_threshold_seconds = request_timeout_seconds,
                        "request timed out"
                    );

                    IngestError::DeadlineExceeded.into_response()
                }
            }
        },
    ))
}
