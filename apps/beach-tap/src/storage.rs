use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::StorageError;

/// Durable record anchoring a session. Only the target address has to
/// survive a restart; captured traffic never lands here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub target_address: Option<String>,
}

impl SessionInfo {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            target_address: None,
        }
    }
}

struct MemoryRecord {
    info: SessionInfo,
    expires_at: Option<Instant>,
}

impl MemoryRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Clone)]
enum Backend {
    Memory {
        records: Arc<RwLock<HashMap<String, MemoryRecord>>>,
        ttl: Option<Duration>,
    },
    Redis(ConnectionManager),
}

#[derive(Clone)]
pub struct Storage {
    backend: Backend,
    ttl_seconds: u64,
}

impl Storage {
    /// Process-local records that never expire.
    pub fn memory() -> Self {
        Self::memory_backend(None)
    }

    /// Process-local records that expire like their Redis counterparts.
    pub fn memory_with_ttl(ttl: Duration) -> Self {
        Self::memory_backend(Some(ttl))
    }

    fn memory_backend(ttl: Option<Duration>) -> Self {
        Self {
            backend: Backend::Memory {
                records: Arc::new(RwLock::new(HashMap::new())),
                ttl,
            },
            ttl_seconds: ttl.map_or(0, |ttl| ttl.as_secs()),
        }
    }

    pub async fn redis(redis_url: &str, ttl_seconds: u64) -> Result<Self, StorageError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self {
            backend: Backend::Redis(redis),
            ttl_seconds: ttl_seconds.max(1),
        })
    }

    /// Connects to Redis unless ephemeral mode was requested. A Redis that
    /// cannot be reached is an error, never a silent fallback.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        if config.ephemeral {
            warn!("ephemeral mode: session records kept in memory and lost on restart");
            return Ok(Self::memory_with_ttl(config.session_ttl()));
        }
        info!(
            redis_url = %config.redis_url,
            ttl = config.session_ttl_seconds,
            "using redis session store"
        );
        Self::redis(&config.redis_url, config.session_ttl_seconds).await
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Redis(_))
    }

    fn key(session_id: &str) -> String {
        format!("tap:session:{}", session_id)
    }

    pub async fn register_session(&self, session: &SessionInfo) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Memory { records, ttl } => {
                let now = Instant::now();
                let mut records = records.write().await;
                records.retain(|_, record| record.is_live(now));
                records.insert(
                    session.session_id.clone(),
                    MemoryRecord {
                        info: session.clone(),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
            }
            Backend::Redis(redis) => {
                let mut conn = redis.clone();
                let value = serde_json::to_string(session)?;
                conn.set_ex::<_, _, ()>(Self::key(&session.session_id), value, self.ttl_seconds)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>, StorageError> {
        match &self.backend {
            Backend::Memory { records, .. } => {
                let now = Instant::now();
                Ok(records
                    .read()
                    .await
                    .get(session_id)
                    .filter(|record| record.is_live(now))
                    .map(|record| record.info.clone()))
            }
            Backend::Redis(redis) => {
                let mut conn = redis.clone();
                let value: Option<String> = conn.get(Self::key(session_id)).await?;
                match value {
                    Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Overwrites the target on the session record, recreating the record if
    /// it has expired underneath a resident session.
    pub async fn set_target(&self, session_id: &str, address: &str) -> Result<(), StorageError> {
        let mut record = self
            .get_session(session_id)
            .await?
            .unwrap_or_else(|| SessionInfo::new(session_id.to_string()));
        record.target_address = Some(address.to_string());
        self.register_session(&record).await
    }

    pub async fn get_target(&self, session_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .get_session(session_id)
            .await?
            .and_then(|record| record.target_address))
    }

    pub async fn update_session_ttl(&self, session_id: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Memory { records, ttl } => {
                if let Some(ttl) = ttl {
                    let now = Instant::now();
                    if let Some(record) = records.write().await.get_mut(session_id) {
                        if record.is_live(now) {
                            record.expires_at = Some(now + *ttl);
                        }
                    }
                }
            }
            Backend::Redis(redis) => {
                let mut conn = redis.clone();
                conn.expire::<_, ()>(Self::key(session_id), self.ttl_seconds as i64)
                    .await?;
            }
        }
        Ok(())
    }
}
