use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::IngestError;
use crate::redis::{CacheError, Client};

// TRICKY: these cache entries are written by the web application. If the
// serialized shape ever drifts, token lookups start failing closed.
pub const TEAM_TOKEN_CACHE_PREFIX: &str = "ingest:1:team_token:";
pub const TEAM_ID_CACHE_PREFIX: &str = "ingest:1:team_id:";
pub const PERSONAL_KEY_CACHE_PREFIX: &str = "ingest:1:personal_api_key:";

/// The tenant events are attributed to. Read-only for this pipeline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Team {
    pub id: i64,
    pub api_token: String,
    #[serde(default)]
    pub anonymize_ips: bool,
}

/// A principal holding a personal API key. `team_ids` is the membership
/// set consulted by the fallback auth path.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub team_ids: Vec<i64>,
}

/// Read access to the externally-owned identity store. Handlers hold a
/// reference across awaits, so implementations must be shareable.
#[async_trait]
pub trait TeamStore: Send + Sync {
    /// Direct lookup by public client token.
    async fn team_by_token(&self, token: &str) -> Result<Option<Team>, IngestError>;
    /// Lookup of the principal owning a personal API key.
    async fn user_by_personal_key(&self, key: &str) -> Result<Option<User>, IngestError>;
    /// Resolves a team the user is a member of. Returns None when the team
    /// does not exist or the user has no membership, indistinguishably.
    async fn team_for_user(&self, user: &User, team_id: i64) -> Result<Option<Team>, IngestError>;
}

fn map_cache_error(e: CacheError) -> IngestError {
    match e {
        CacheError::NotFound => unreachable!("mapped to None by callers"),
        CacheError::Redis(err) => {
            tracing::error!("identity cache error: {}", err);
            IngestError::StoreUnavailable
        }
        CacheError::Timeout(_) => {
            tracing::error!("identity cache lookup timed out");
            IngestError::StoreUnavailable
        }
    }
}

async fn fetch_json<T: for<'de> Deserialize<'de>>(
    redis: &Arc<dyn Client + Send + Sync>,
    key: String,
) -> Result<Option<T>, IngestError> {
    let serialized = match redis.get(key).await {
        Ok(value) => value,
        Err(CacheError::NotFound) => return Ok(None),
        Err(e) => return Err(map_cache_error(e)),
    };

    let parsed = serde_json::from_str(&serialized).map_err(|e| {
        tracing::error!("failed to parse identity cache entry: {}", e);
        IngestError::StoreUnavailable
    })?;
    Ok(Some(parsed))
}

/// Identity store backed by the web application's redis cache.
pub struct RedisTeamStore {
    redis: Arc<dyn Client + Send + Sync>,
}

impl RedisTeamStore {
    pub fn new(redis: Arc<dyn Client + Send + Sync>) -> RedisTeamStore {
        RedisTeamStore { redis }
    }
}

#[async_trait]
impl TeamStore for RedisTeamStore {
    #[instrument(skip_all)]
    async fn team_by_token(&self, token: &str) -> Result<Option<Team>, IngestError> {
        fetch_json(&self.redis, format!("{TEAM_TOKEN_CACHE_PREFIX}{token}")).await
    }

    #[instrument(skip_all)]
    async fn user_by_personal_key(&self, key: &str) -> Result<Option<User>, IngestError> {
        fetch_json(&self.redis, format!("{PERSONAL_KEY_CACHE_PREFIX}{key}")).await
    }

    #[instrument(skip_all)]
    async fn team_for_user(&self, user: &User, team_id: i64) -> Result<Option<Team>, IngestError> {
        if !user.team_ids.contains(&team_id) {
            return Ok(None);
        }
        fetch_json(&self.redis, format!("{TEAM_ID_CACHE_PREFIX}{team_id}")).await
    }
}

/// In-memory store for tests and local development.
#[derive(Clone, Default)]
pub struct MockTeamStore {
    teams: HashMap<String, Team>,
    teams_by_id: HashMap<i64, Team>,
    users: HashMap<String, User>,
}

impl MockTeamStore {
    pub fn new() -> MockTeamStore {
        Default::default()
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.teams_by_id.insert(team.id, team.clone());
        self.teams.insert(team.api_token.clone(), team);
        self
    }

    pub fn with_personal_key(mut self, key: &str, user: User) -> Self {
        self.users.insert(key.to_string(), user);
        self
    }
}

#[async_trait]
impl TeamStore for MockTeamStore {
    async fn team_by_token(&self, token: &str) -> Result<Option<Team>, IngestError> {
        Ok(self.teams.get(token).cloned())
    }

    async fn user_by_personal_key(&self, key: &str) -> Result<Option<User>, IngestError> {
        Ok(self.users.get(key).cloned())
    }

    async fn team_for_user(&self, user: &User, team_id: i64) -> Result<Option<Team>, IngestError> {
        if !user.team_ids.contains(&team_id) {
            return Ok(None);
        }
        Ok(self.teams_by_id.get(&team_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        RedisTeamStore, Team, TeamStore, User, PERSONAL_KEY_CACHE_PREFIX, TEAM_ID_CACHE_PREFIX,
        TEAM_TOKEN_CACHE_PREFIX,
    };
    use crate::redis::{Client, MockRedisClient};

    fn store_with(entries: Vec<(String, String)>) -> RedisTeamStore {
        let mut client = MockRedisClient::new();
        for (k, v) in entries {
            client = client.with_entry(k, v);
        }
        let client: Arc<dyn Client + Send + Sync> = Arc::new(client);
        RedisTeamStore::new(client)
    }

    #[tokio::test]
    async fn team_lookup_by_token() {
        let team = Team {
            id: 42,
            api_token: "phc_apples".to_string(),
            anonymize_ips: true,
        };
        let store = store_with(vec![(
            format!("{TEAM_TOKEN_CACHE_PREFIX}phc_apples"),
            serde_json::to_string(&team).unwrap(),
        )]);

        let found = store.team_by_token("phc_apples").await.unwrap();
        assert_eq!(found, Some(team));

        let missing = store.team_by_token("phc_oranges").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn membership_is_enforced_by_the_lookup() {
        let team = Team {
            id: 7,
            api_token: "phc_pears".to_string(),
            anonymize_ips: false,
        };
        let user = User {
            id: 1,
            team_ids: vec![7],
        };
        let store = store_with(vec![
            (
                format!("{TEAM_ID_CACHE_PREFIX}7"),
                serde_json::to_string(&team).unwrap(),
            ),
            (
                format!("{PERSONAL_KEY_CACHE_PREFIX}phx_key"),
                serde_json::to_string(&user).unwrap(),
            ),
        ]);

        let user = store.user_by_personal_key("phx_key").await.unwrap().unwrap();
        assert_eq!(store.team_for_user(&user, 7).await.unwrap(), Some(team));

        // No membership resolves exactly like a missing team
        assert!(store.team_for_user(&user, 8).await.unwrap().is_none());
    }
}
