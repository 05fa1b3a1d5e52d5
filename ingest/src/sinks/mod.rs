use async_trait::async_trait;

use crate::api::IngestError;
use crate::request::ProcessedEvent;

pub mod kafka;
pub mod print;
pub mod queue;

/// Delivery backend for normalized events. Exactly one implementation is
/// wired per process, chosen at startup.
#[async_trait]
pub trait Event {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError>;
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError>;
}

// Lets a sink picked at runtime flow through the generic router signature
#[async_trait]
impl Event for Box<dyn Event + Send + Sync> {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        self.as_ref().send(event).await
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        self.as_ref().send_batch(events).await
    }
}
