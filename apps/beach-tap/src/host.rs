use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::HostError;
use crate::fanout::ViewerHandle;
use crate::proxy::ProxyPipeline;
use crate::session::InterceptorSession;
use crate::storage::{SessionInfo, Storage};
use crate::target::validate_target;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub proxy_url: String,
    pub viewer_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,
}

/// Maps session ids to resident sessions, reviving them from storage on demand.
///
/// Viewer connections are tracked here as well, independently of any resident
/// session, so a revived session can re-attach them.
#[derive(Clone)]
pub struct SessionHost {
    sessions: Arc<DashMap<String, Arc<InterceptorSession>>>,
    /// viewer_id -> outbound handle carrying its session affinity
    attached: Arc<DashMap<String, ViewerHandle>>,
    storage: Storage,
    pipeline: ProxyPipeline,
    config: Arc<Config>,
}

impl SessionHost {
    pub fn new(config: Config, storage: Storage) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default http client");
                reqwest::Client::new()
            });
        Self {
            sessions: Arc::new(DashMap::new()),
            attached: Arc::new(DashMap::new()),
            storage,
            pipeline: ProxyPipeline::new(client, config.forward_timeout()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &ProxyPipeline {
        &self.pipeline
    }

    pub async fn create_session(
        &self,
        target: Option<&str>,
    ) -> Result<CreatedSession, HostError> {
        let target = target.map(validate_target).transpose()?;
        let session_id = Uuid::new_v4().to_string();
        let mut record = SessionInfo::new(session_id.clone());
        record.target_address = target.as_ref().map(|url| url.to_string());
        self.storage.register_session(&record).await?;

        let session = Arc::new(self.build_session(&record));
        self.sessions.insert(session_id.clone(), session);
        info!(session = %session_id, target = ?record.target_address, "session created");

        let base = self.config.public_base_url();
        Ok(CreatedSession {
            proxy_url: proxy_url(&base, &session_id),
            viewer_url: websocket_url(&base, &session_id),
            target_address: record.target_address,
            session_id,
        })
    }

    fn build_session(&self, record: &SessionInfo) -> InterceptorSession {
        InterceptorSession::new(
            record.session_id.clone(),
            record.created_at,
            self.storage.clone(),
            self.config.log_capacity,
        )
    }

    /// Returns the resident session, reviving it from its durable record if it
    /// was suspended. Revival re-attaches surviving viewer connections. Every
    /// lookup extends the durable record's TTL.
    pub async fn session(&self, session_id: &str) -> Result<Arc<InterceptorSession>, HostError> {
        let resident = self.sessions.get(session_id).map(|entry| entry.value().clone());
        if let Some(resident) = resident {
            self.refresh_ttl(session_id).await;
            return Ok(resident);
        }

        let record = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| HostError::NotFound(session_id.to_string()))?;

        let session = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let session = Arc::new(self.build_session(&record));
                let recovered = session.recover(self.attached_for(session_id));
                slot.insert(session.clone());
                info!(session = %session_id, recovered, "session revived");
                session
            }
        };

        self.refresh_ttl(session_id).await;
        Ok(session)
    }

    async fn refresh_ttl(&self, session_id: &str) {
        if let Err(err) = self.storage.update_session_ttl(session_id).await {
            warn!(session = %session_id, error = %err, "failed to refresh session ttl");
        }
    }

    fn attached_for(&self, session_id: &str) -> Vec<ViewerHandle> {
        self.attached
            .iter()
            .filter(|entry| entry.value().session_id() == session_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drops the resident session. Its ledger is lost; viewer connections stay
    /// attached and are recovered on the next revival.
    pub fn suspend(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!(session = %session_id, "session suspended");
        }
        removed
    }

    /// Registers a new viewer connection with its session and records it at
    /// the transport level.
    pub fn attach_viewer(&self, session: &InterceptorSession, handle: ViewerHandle) -> bool {
        let viewer_id = handle.viewer_id().to_string();
        if !session.register_viewer(handle.clone()) {
            return false;
        }
        self.attached.insert(viewer_id, handle);
        true
    }

    pub fn detach_viewer(&self, session_id: &str, viewer_id: &str) {
        self.attached.remove(viewer_id);
        if let Some(resident) = self.sessions.get(session_id) {
            resident.unregister_viewer(viewer_id);
        }
    }

    /// Suspends sessions idle longer than the configured timeout.
    pub fn suspend_idle(&self, idle_timeout: Duration) -> usize {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        // Removal happens after iteration so no shard guard is held.
        idle.iter().filter(|id| self.suspend(id)).count()
    }

    pub fn spawn_idle_reaper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let idle_timeout = self.config.idle_timeout()?;
        let host = self.clone();
        Some(tokio::spawn(async move {
            let period = idle_timeout.min(Duration::from_secs(60));
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let suspended = host.suspend_idle(idle_timeout);
                if suspended > 0 {
                    debug!(suspended, "idle sessions suspended");
                }
            }
        }))
    }
}

pub fn proxy_url(base_http: &str, session_id: &str) -> String {
    format!(
        "{}/sessions/{}/proxy",
        base_http.trim_end_matches('/'),
        session_id
    )
}

pub fn websocket_url(base_http: &str, session_id: &str) -> String {
    let ws_base = if let Some(rest) = base_http.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http)
    };
    format!("{}/ws/{}", ws_base.trim_end_matches('/'), session_id)
}
