use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// Lookups sit on the hot path of every request, so a slow cache is treated
// as unavailable rather than waited on.
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// The subset of redis we use, wrapped for mockability.
#[async_trait]
pub trait Client {
    async fn get(&self, key: String) -> Result<String, CacheError>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> anyhow::Result<RedisClient> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, key: String) -> Result<String, CacheError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get(key);
        let value: Option<String> =
            timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        value.ok_or(CacheError::NotFound)
    }
}

#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: HashMap<String, String>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        Default::default()
    }

    pub fn with_entry(mut self, key: String, value: String) -> Self {
        self.entries.insert(key, value);
        self
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CacheError> {
        match self.entries.get(&key) {
            Some(value) => Ok(value.clone()),
            None => Err(CacheError::NotFound),
        }
    }
}
