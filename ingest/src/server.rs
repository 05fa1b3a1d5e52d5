use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::{Config, DeliveryMode};
use crate::flags::CachedFlagEvaluator;
use crate::recordings::SnapshotGate;
use crate::redis::RedisClient;
use crate::router;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;
use crate::sinks::queue::QueueSink;
use crate::sinks::Event;
use crate::team::RedisTeamStore;
use crate::time::SystemTime;

async fn create_sink(config: &Config) -> anyhow::Result<Box<dyn Event + Send + Sync>> {
    if config.print_sink {
        // Only for local debug, a process running it delivers nothing
        return Ok(Box::new(PrintSink {}));
    }

    match config.delivery_mode {
        DeliveryMode::Streaming => Ok(Box::new(KafkaSink::new(config.kafka.clone())?)),
        DeliveryMode::Queued => {
            let database_url = config
                .queue
                .queue_database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("queued delivery requires QUEUE_DATABASE_URL"))?;
            Ok(Box::new(
                QueueSink::new(config.queue.clone(), database_url).await?,
            ))
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let redis_client = Arc::new(
        RedisClient::new(config.redis_url.clone()).expect("failed to create redis client"),
    );

    let sink = create_sink(&config).await.expect("failed to create sink");

    let app = router::router(
        SystemTime {},
        sink,
        RedisTeamStore::new(redis_client.clone()),
        CachedFlagEvaluator::new(redis_client),
        SnapshotGate,
        Duration::from_millis(config.flag_timeout_ms),
        config.request_timeout_seconds,
        config.export_prometheus,
    );

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("failed to serve HTTP")
}
