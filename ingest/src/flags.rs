use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::redis::{CacheError, Client};
use crate::team::Team;

pub const FLAGS_CACHE_PREFIX: &str = "ingest:1:team_flags:";

/// External flag-evaluation collaborator. Only the active flag keys for
/// one (team, distinct_id) pair are needed here.
#[async_trait]
pub trait FlagEvaluator {
    async fn active_flags(&self, team: &Team, distinct_id: &str) -> anyhow::Result<Vec<String>>;
}

/// Evaluator reading the per-team active flag list the web application
/// keeps cached. Flags with per-user rollout conditions are resolved
/// downstream, not here.
pub struct CachedFlagEvaluator {
    redis: Arc<dyn Client + Send + Sync>,
}

impl CachedFlagEvaluator {
    pub fn new(redis: Arc<dyn Client + Send + Sync>) -> CachedFlagEvaluator {
        CachedFlagEvaluator { redis }
    }
}

#[async_trait]
impl FlagEvaluator for CachedFlagEvaluator {
    #[instrument(skip_all, fields(team_id = team.id))]
    async fn active_flags(&self, team: &Team, _distinct_id: &str) -> anyhow::Result<Vec<String>> {
        let serialized = match self.redis.get(format!("{FLAGS_CACHE_PREFIX}{}", team.id)).await {
            Ok(value) => value,
            Err(CacheError::NotFound) => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&serialized)?)
    }
}

/// Fixed flag set for tests and local development.
#[derive(Clone, Default)]
pub struct StaticFlagEvaluator {
    flags: Vec<String>,
}

impl StaticFlagEvaluator {
    pub fn new(flags: Vec<String>) -> StaticFlagEvaluator {
        StaticFlagEvaluator { flags }
    }
}

#[async_trait]
impl FlagEvaluator for StaticFlagEvaluator {
    async fn active_flags(&self, _team: &Team, _distinct_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.flags.clone())
    }
}
