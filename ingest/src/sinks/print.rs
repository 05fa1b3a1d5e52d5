use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::instrument;
use tracing::log::info;

use crate::api::IngestError;
use crate::request::ProcessedEvent;
use crate::sinks::Event;

/// Logs events instead of delivering them. For local development only.
pub struct PrintSink {}

#[async_trait]
impl Event for PrintSink {
    #[instrument(skip_all)]
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        info!("single event: {:?}", event);
        counter!("ingest_events_delivered_total").increment(1);

        Ok(())
    }

    #[instrument(skip_all)]
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        histogram!("ingest_event_batch_size").record(events.len() as f64);
        counter!("ingest_events_delivered_total").increment(events.len() as u64);
        for event in events {
            info!("event: {:?}", event);
        }

        Ok(())
    }
}
