use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tap_proto::{LogEntry, ViewerEvent};
use tracing::{debug, info};
use url::Url;

use crate::error::TargetError;
use crate::fanout::{ViewerFanout, ViewerHandle};
use crate::ledger::LogLedger;
use crate::storage::Storage;
use crate::target::TargetStore;

struct SessionCore {
    ledger: LogLedger,
    fanout: ViewerFanout,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub target_address: Option<String>,
    pub viewer_count: usize,
    pub log_count: usize,
}

/// One interceptor session: target config, traffic ledger and viewers.
///
/// The ledger and viewer registry share a single lock. Appends and clears
/// broadcast while holding it, and registration snapshots the ledger under
/// it, so every viewer sees each entry exactly once.
pub struct InterceptorSession {
    session_id: String,
    created_at: DateTime<Utc>,
    target: TargetStore,
    core: Mutex<SessionCore>,
    last_activity: Mutex<Instant>,
}

impl InterceptorSession {
    pub fn new(
        session_id: String,
        created_at: DateTime<Utc>,
        storage: Storage,
        log_capacity: usize,
    ) -> Self {
        Self {
            target: TargetStore::new(session_id.clone(), storage),
            core: Mutex::new(SessionCore {
                ledger: LogLedger::new(log_capacity),
                fanout: ViewerFanout::new(session_id.clone()),
            }),
            last_activity: Mutex::new(Instant::now()),
            session_id,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn set_target(&self, address: &str) -> Result<Url, TargetError> {
        self.touch();
        self.target.set(address).await
    }

    pub async fn get_target(&self) -> Result<Option<Url>, TargetError> {
        self.target.get().await
    }

    pub async fn info(&self) -> Result<SessionSummary, TargetError> {
        let target_address = self.get_target().await?.map(String::from);
        let core = self.core();
        Ok(SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            target_address,
            viewer_count: core.fanout.len(),
            log_count: core.ledger.len(),
        })
    }

    /// Appends `entry` and pushes it to every viewer.
    pub fn log_entry(&self, entry: LogEntry) {
        self.touch();
        let mut core = self.core();
        let evicted = core.ledger.append(entry.clone());
        if evicted > 0 {
            debug!(session = %self.session_id, evicted, "ledger at capacity");
        }
        core.fanout.broadcast(&ViewerEvent::NewLog { log: entry });
    }

    pub fn clear_log(&self) {
        self.touch();
        let mut core = self.core();
        let dropped = core.ledger.clear();
        let notified = core.fanout.broadcast(&ViewerEvent::LogsCleared);
        info!(session = %self.session_id, dropped, notified, "log cleared");
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.core().ledger.snapshot()
    }

    /// Registers a viewer and sends it the current ledger as its replay.
    pub fn register_viewer(&self, handle: ViewerHandle) -> bool {
        self.touch();
        let mut core = self.core();
        let replay = core.ledger.snapshot();
        core.fanout.register(handle, replay)
    }

    pub fn unregister_viewer(&self, viewer_id: &str) -> bool {
        self.core().fanout.unregister(viewer_id)
    }

    /// Rebuilds the viewer registry from connections that outlived a
    /// suspension. Recovered viewers still hold entries from before the
    /// suspension, so an empty ledger is announced to them as a clear.
    pub fn recover<I>(&self, handles: I) -> usize
    where
        I: IntoIterator<Item = ViewerHandle>,
    {
        let mut core = self.core();
        let recovered = core.fanout.recover(handles);
        if recovered > 0 && core.ledger.is_empty() {
            core.fanout.broadcast(&ViewerEvent::LogsCleared);
        }
        recovered
    }

    pub fn viewer_count(&self) -> usize {
        self.core().fanout.len()
    }

    pub fn log_count(&self) -> usize {
        self.core().ledger.len()
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}
