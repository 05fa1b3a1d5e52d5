use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{MatchedPath, Query, State};
use axum::http::{HeaderMap, Method};
use axum::Json;
use axum_client_ip::InsecureClientIp;
use base64::Engine;
use bytes::Bytes;
use metrics::counter;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::api::{IngestError, IngestResponse};
use crate::auth::{authenticate, discover_token};
use crate::flags::FlagEvaluator;
use crate::prometheus::report_dropped_events;
use crate::request::{
    EventFormData, EventQuery, ProcessedEvent, ProcessingContext, RawEvent, RawRequest,
    resolve_sent_at,
};
use crate::router;
use crate::sinks;

/// Reconstructs the base URL the client hit, for downstream use.
fn extract_site_url(headers: &HeaderMap) -> String {
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return String::new();
    };
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

#[instrument(
    skip_all,
    fields(
        token,
        batch_size,
        user_agent,
        content_type,
        version,
        method
    )
)]
pub async fn event(
    state: State<router::State>,
    InsecureClientIp(ip): InsecureClientIp,
    meta: Query<EventQuery>,
    headers: HeaderMap,
    method: Method,
    path: MatchedPath,
    body: Bytes,
) -> Result<Json<IngestResponse>, IngestError> {
    let now = state.timesource.current_time();

    let user_agent = headers
        .get("user-agent")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    tracing::Span::current().record("user_agent", user_agent);
    tracing::Span::current().record("version", meta.lib_version.clone());
    tracing::Span::current().record("method", method.as_str());

    let mut form = EventFormData::default();
    let content_type = headers
        .get("content-type")
        .map_or("", |v| v.to_str().unwrap_or(""));
    tracing::Span::current().record("content_type", content_type);

    let payload = if content_type.starts_with("application/x-www-form-urlencoded") {
        form = serde_urlencoded::from_bytes(body.deref()).map_err(|e| {
            tracing::error!("failed to decode form body: {}", e);
            IngestError::RequestDecodingError(String::from("invalid form data"))
        })?;
        match form.data.as_deref() {
            None | Some("") => return Err(IngestError::NoData),
            // Usually base64; a few SDK versions post the JSON string as-is
            Some(data) => match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(decoded) => Bytes::from(decoded),
                Err(_) => Bytes::from(data.as_bytes().to_vec()),
            },
        }
    } else {
        body
    };

    let compression = meta.compression.or(form.compression);
    let raw = RawRequest::from_bytes(payload, compression)?;

    let sent_at = resolve_sent_at(&meta, &form, &raw)?;

    let token = discover_token(&meta, &form, &raw).ok_or(IngestError::NoTokenError)?;
    tracing::Span::current().record("token", token.as_str());

    let team = authenticate(state.teams.as_ref(), &token, &meta, &form, &raw).await?;

    let context = ProcessingContext {
        lib_version: meta.lib_version.clone(),
        sent_at,
        team,
        now,
        client_ip: ip.to_string(),
        site_url: extract_site_url(&headers),
    };

    let mut events = raw.events();
    if events.is_empty() {
        return Err(IngestError::NoData);
    }
    tracing::Span::current().record("batch_size", events.len());
    counter!("ingest_events_received_total").increment(events.len() as u64);

    // Identify-style alias path: guarantee an event name
    if path.as_str().starts_with("/engage") {
        for event in events.iter_mut() {
            if event.event.is_empty() {
                event.event = String::from("$identify");
            }
        }
    }

    let events = state.recordings.transform(events)?;

    tracing::debug!(context=?context, "decoded request");

    if let Err(err) = process_events(
        state.sink.clone(),
        state.flags.clone(),
        state.flag_timeout,
        events,
        &context,
    )
    .await
    {
        report_dropped_events(err.to_metric_tag(), 1);
        tracing::warn!("rejected payload: {}", err);
        return Err(err);
    }

    Ok(Json(IngestResponse::ok()))
}

pub async fn options() -> Result<Json<IngestResponse>, IngestError> {
    Ok(Json(IngestResponse::ok()))
}

/// Best-effort flag enrichment for browser events. Evaluator latency or
/// failure must not block ingestion, so the call is bounded and a miss is
/// logged and skipped.
async fn inject_web_feature_flags(
    event: &mut RawEvent,
    distinct_id: &str,
    flags: &Arc<dyn FlagEvaluator + Send + Sync>,
    flag_timeout: Duration,
    context: &ProcessingContext,
) {
    let is_web = event
        .properties
        .get("$lib")
        .and_then(|v| v.as_str())
        .map_or(false, |lib| lib == "web");
    if !is_web || event.properties.contains_key("$active_feature_flags") {
        return;
    }

    match tokio::time::timeout(flag_timeout, flags.active_flags(&context.team, distinct_id)).await
    {
        Ok(Ok(active)) => {
            event
                .properties
                .insert(String::from("$active_feature_flags"), json!(active));
        }
        Ok(Err(e)) => {
            counter!("ingest_flag_enrichment_failures_total", "cause" => "error").increment(1);
            tracing::warn!("flag evaluation failed, skipping enrichment: {}", e);
        }
        Err(_) => {
            counter!("ingest_flag_enrichment_failures_total", "cause" => "timeout").increment(1);
            tracing::warn!("flag evaluation timed out, skipping enrichment");
        }
    }
}

#[instrument(skip_all)]
pub async fn process_single_event(
    event: &mut RawEvent,
    flags: &Arc<dyn FlagEvaluator + Send + Sync>,
    flag_timeout: Duration,
    context: &ProcessingContext,
) -> Result<ProcessedEvent, IngestError> {
    let distinct_id = event.extract_distinct_id()?;

    if event.event.is_empty() {
        return Err(IngestError::MissingEventName);
    }

    inject_web_feature_flags(event, &distinct_id, flags, flag_timeout, context).await;

    // `properties` is always serialized, empty mapping included, so the
    // record never carries a null properties container
    let data = serde_json::to_string(&event).map_err(|e| {
        tracing::error!("failed to encode data field: {}", e);
        IngestError::NonRetryableSinkError
    })?;

    Ok(ProcessedEvent {
        uuid: Uuid::now_v7(),
        distinct_id,
        ip: if context.team.anonymize_ips {
            None
        } else {
            Some(context.client_ip.clone())
        },
        site_url: context.site_url.clone(),
        data,
        team_id: context.team.id,
        now: context.now.clone(),
        sent_at: context.sent_at,
    })
}

/// Normalizes the whole batch before anything is delivered: one invalid
/// event aborts the request with nothing published, never a partial batch.
#[instrument(skip_all, fields(events = events.len()))]
pub async fn process_events(
    sink: Arc<dyn sinks::Event + Send + Sync>,
    flags: Arc<dyn FlagEvaluator + Send + Sync>,
    flag_timeout: Duration,
    mut events: Vec<RawEvent>,
    context: &ProcessingContext,
) -> Result<(), IngestError> {
    let mut processed = Vec::with_capacity(events.len());
    for event in events.iter_mut() {
        processed.push(process_single_event(event, &flags, flag_timeout, context).await?);
    }

    tracing::debug!("processed {} events", processed.len());

    if processed.len() == 1 {
        sink.send(processed.pop().expect("one event")).await
    } else {
        sink.send_batch(processed).await
    }
}
