use std::net::SocketAddr;

use envconfig::Envconfig;

/// Which delivery backend this process hands events to. Exactly one is
/// active; the other's configuration is ignored.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryMode {
    Streaming,
    Queued,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "streaming" => Ok(DeliveryMode::Streaming),
            "queued" => Ok(DeliveryMode::Queued),
            _ => Err(format!("Unknown delivery mode: {s}")),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    pub redis_url: String,

    #[envconfig(default = "streaming")]
    pub delivery_mode: DeliveryMode,

    // Budget for the best-effort flag enrichment of browser events
    #[envconfig(default = "200")]
    pub flag_timeout_ms: u64,

    pub request_timeout_seconds: Option<u64>,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub queue: QueueConfig,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "1000000")]
    pub kafka_producer_message_max_bytes: u32, // message.max.bytes - max kafka message size we will produce
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    pub kafka_hosts: String,
    #[envconfig(default = "events_wal")]
    pub kafka_wal_topic: String,
    #[envconfig(default = "events_plugin_ingestion")]
    pub kafka_ingestion_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

#[derive(Envconfig, Clone)]
pub struct QueueConfig {
    pub queue_database_url: Option<String>,
    #[envconfig(default = "10")]
    pub queue_max_connections: u32,
    #[envconfig(default = "events_low_priority")]
    pub queue_name: String,
    #[envconfig(default = "process_event_with_plugins")]
    pub queue_task: String,
    #[envconfig(default = "job_queue")]
    pub queue_table: String,
}

#[cfg(test)]
mod tests {
    use super::DeliveryMode;

    #[test]
    fn delivery_mode_parsing() {
        assert_eq!(
            " Streaming ".parse::<DeliveryMode>().unwrap(),
            DeliveryMode::Streaming
        );
        assert_eq!(
            "queued".parse::<DeliveryMode>().unwrap(),
            DeliveryMode::Queued
        );
        assert!("pigeon".parse::<DeliveryMode>().is_err());
    }
}
