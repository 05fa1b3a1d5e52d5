use async_trait::async_trait;
use metrics::{counter, histogram};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::log::{error, info};
use tracing::instrument;

use crate::api::IngestError;
use crate::config::QueueConfig;
use crate::request::ProcessedEvent;
use crate::sinks::Event;

/// Hands events to the task-queue workers instead of Kafka. Each event
/// becomes one job row holding the task name and the serialized event as
/// JSONB parameters; workers poll for 'available' rows.
pub struct QueueSink {
    pool: PgPool,
    table: String,
    queue_name: String,
    task_name: String,
}

impl QueueSink {
    pub async fn new(config: QueueConfig, database_url: &str) -> anyhow::Result<QueueSink> {
        info!("connecting to the task queue database...");
        let pool = PgPoolOptions::new()
            .max_connections(config.queue_max_connections)
            .connect(database_url)
            .await?;
        info!("connected to the task queue database");

        Ok(QueueSink {
            pool,
            table: config.queue_table,
            queue_name: config.queue_name,
            task_name: config.queue_task,
        })
    }

    // sqlx cannot bind identifiers, the table name is interpolated
    fn insert_statement(&self) -> String {
        format!(
            r#"
INSERT INTO {}
    (queue, task, status, created_at, parameters)
VALUES
    ($1, $2, 'available', NOW(), $3)
            "#,
            &self.table
        )
    }

    async fn enqueue<'c, E>(&self, executor: E, event: &ProcessedEvent) -> Result<(), IngestError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        sqlx::query(&self.insert_statement())
            .bind(&self.queue_name)
            .bind(&self.task_name)
            .bind(sqlx::types::Json(event))
            .execute(executor)
            .await
            .map_err(|e| {
                error!("failed to enqueue event: {}", e);
                IngestError::RetryableSinkError
            })?;

        Ok(())
    }
}

#[async_trait]
impl Event for QueueSink {
    #[instrument(skip_all)]
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        self.enqueue(&self.pool, &event).await?;
        counter!("ingest_events_delivered_total").increment(1);
        histogram!("ingest_event_batch_size").record(1.0);
        Ok(())
    }

    #[instrument(skip_all)]
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        // One transaction per batch so a mid-batch failure leaves no
        // partial jobs behind
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("failed to open queue transaction: {}", e);
            IngestError::RetryableSinkError
        })?;

        let batch_size = events.len();
        for event in &events {
            self.enqueue(&mut *tx, event).await?;
        }

        tx.commit().await.map_err(|e| {
            error!("failed to commit queue transaction: {}", e);
            IngestError::RetryableSinkError
        })?;

        counter!("ingest_events_delivered_total").increment(batch_size as u64);
        histogram!("ingest_event_batch_size").record(batch_size as f64);
        Ok(())
    }
}
