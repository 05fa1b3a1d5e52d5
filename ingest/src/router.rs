use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::capture;
use crate::flags::FlagEvaluator;
use crate::metrics_middleware::{apply_request_timeout, track_metrics};
use crate::prometheus::setup_metrics_recorder;
use crate::recordings::RecordingTransform;
use crate::sinks;
use crate::team::TeamStore;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn sinks::Event + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub teams: Arc<dyn TeamStore + Send + Sync>,
    pub flags: Arc<dyn FlagEvaluator + Send + Sync>,
    pub recordings: Arc<dyn RecordingTransform + Send + Sync>,
    pub flag_timeout: Duration,
}

async fn index() -> &'static str {
    "ingest"
}

#[allow(clippy::too_many_arguments)]
pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    S: sinks::Event + Send + Sync + 'static,
    T: TeamStore + Send + Sync + 'static,
    F: FlagEvaluator + Send + Sync + 'static,
    R: RecordingTransform + Send + Sync + 'static,
>(
    timesource: TZ,
    sink: S,
    teams: T,
    flags: F,
    recordings: R,
    flag_timeout: Duration,
    request_timeout_seconds: Option<u64>,
    metrics: bool,
) -> Router {
    let state = State {
        sink: Arc::new(sink),
        timesource: Arc::new(timesource),
        teams: Arc::new(teams),
        flags: Arc::new(flags),
        recordings: Arc::new(recordings),
        flag_timeout,
    };

    // Very permissive CORS policy, as old SDK versions
    // and reverse proxies might send funky headers.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let router = Router::new()
        // TODO: use NormalizePathLayer::trim_trailing_slash
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route(
            "/e",
            post(capture::event)
                .get(capture::event)
                .options(capture::options),
        )
        .route(
            "/e/",
            post(capture::event)
                .get(capture::event)
                .options(capture::options),
        )
        .route(
            "/engage",
            post(capture::event)
                .get(capture::event)
                .options(capture::options),
        )
        .route(
            "/engage/",
            post(capture::event)
                .get(capture::event)
                .options(capture::options),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    let router = apply_request_timeout(router, request_timeout_seconds);

    // Don't install metrics unless asked to
    // Installing a global recorder when ingest is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
