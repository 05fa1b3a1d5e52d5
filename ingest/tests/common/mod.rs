use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use ingest::api::IngestError;
use ingest::flags::StaticFlagEvaluator;
use ingest::recordings::SnapshotGate;
use ingest::request::ProcessedEvent;
use ingest::router::router;
use ingest::sinks::Event;
use ingest::team::{MockTeamStore, Team, User};
use ingest::time::TimeSource;

pub const FIXED_NOW: &str = "2024-03-01T10:00:00Z";
pub const CLIENT_IP: &str = "203.0.113.10";
pub const PUBLIC_TOKEN: &str = "phc_public";
pub const ANONYMOUS_TOKEN: &str = "phc_anonymous";
pub const PERSONAL_KEY: &str = "phx_personal";

#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.clone()
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProcessedEvent>>>,
}

impl MemorySink {
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<ProcessedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Event for MemorySink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        self.events.lock().unwrap().extend_from_slice(&events);
        Ok(())
    }
}

/// Two tenants and one personal key scoped to the first of them.
pub fn default_store() -> MockTeamStore {
    MockTeamStore::new()
        .with_team(Team {
            id: 1,
            api_token: PUBLIC_TOKEN.to_string(),
            anonymize_ips: false,
        })
        .with_team(Team {
            id: 2,
            api_token: ANONYMOUS_TOKEN.to_string(),
            anonymize_ips: true,
        })
        .with_personal_key(
            PERSONAL_KEY,
            User {
                id: 100,
                team_ids: vec![1],
            },
        )
}

pub struct TestHarness {
    pub app: Router,
    pub sink: MemorySink,
}

pub fn harness() -> TestHarness {
    harness_with(default_store(), vec![])
}

pub fn harness_with(store: MockTeamStore, flags: Vec<String>) -> TestHarness {
    let sink = MemorySink::default();
    let app = router(
        FixedTime {
            time: FIXED_NOW.to_string(),
        },
        sink.clone(),
        store,
        StaticFlagEvaluator::new(flags),
        SnapshotGate,
        Duration::from_millis(200),
        None,
        false,
    );
    TestHarness { app, sink }
}

impl TestHarness {
    pub async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: impl Into<Body>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", content_type)
            .header("X-Forwarded-For", CLIENT_IP)
            .body(body.into())
            .expect("failed to build request");

        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn post_json(&self, path: &str, body: impl Into<Body>) -> (StatusCode, Value) {
        self.post(path, "application/json", body).await
    }
}
