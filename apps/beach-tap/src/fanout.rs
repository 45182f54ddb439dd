use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tap_proto::{LogEntry, ViewerEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Session affinity carried by a viewer connection so the registry can be
/// rebuilt from surviving connections after the session is revived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewerAffinity {
    pub session_id: String,
    pub viewer_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("viewer {viewer_id} stopped receiving")]
    Closed { viewer_id: String },
    #[error("viewer {viewer_id} has {capacity} undelivered events")]
    Stalled { viewer_id: String, capacity: usize },
}

/// Outbound half of one viewer connection.
///
/// The queue is bounded; a viewer that stops draining it is evicted instead
/// of buffering without limit.
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    affinity: ViewerAffinity,
    tx: mpsc::Sender<ViewerEvent>,
    evicted: Arc<Notify>,
}

impl ViewerHandle {
    pub fn new(session_id: &str, tx: mpsc::Sender<ViewerEvent>) -> Self {
        Self {
            affinity: ViewerAffinity {
                session_id: session_id.to_string(),
                viewer_id: Uuid::new_v4().to_string(),
                connected_at: Utc::now(),
            },
            tx,
            evicted: Arc::new(Notify::new()),
        }
    }

    pub fn channel(
        session_id: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ViewerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(session_id, tx), rx)
    }

    pub fn affinity(&self) -> &ViewerAffinity {
        &self.affinity
    }

    pub fn viewer_id(&self) -> &str {
        &self.affinity.viewer_id
    }

    pub fn session_id(&self) -> &str {
        &self.affinity.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send(&self, event: ViewerEvent) -> Result<(), BroadcastError> {
        self.tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => BroadcastError::Stalled {
                viewer_id: self.affinity.viewer_id.clone(),
                capacity: self.tx.max_capacity(),
            },
            TrySendError::Closed(_) => BroadcastError::Closed {
                viewer_id: self.affinity.viewer_id.clone(),
            },
        })
    }

    /// Signals the connection's transport to close.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once the handle has been evicted from its session.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }
}

/// Registry of viewers attached to one session. Callers serialize access
/// together with the ledger so replay and live delivery never overlap.
#[derive(Debug)]
pub struct ViewerFanout {
    session_id: String,
    viewers: HashMap<String, ViewerHandle>,
}

impl ViewerFanout {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            viewers: HashMap::new(),
        }
    }

    /// Sends `replay` as the viewer's initial logs and adds it to the registry.
    /// A viewer that is already gone is not registered.
    pub fn register(&mut self, handle: ViewerHandle, replay: Vec<LogEntry>) -> bool {
        let count = replay.len();
        if let Err(err) = handle.send(ViewerEvent::InitialLogs { logs: replay }) {
            warn!(session = %self.session_id, error = %err, "viewer left before replay");
            return false;
        }
        debug!(
            session = %self.session_id,
            viewer = %handle.viewer_id(),
            replayed = count,
            "viewer registered"
        );
        self.viewers.insert(handle.viewer_id().to_string(), handle);
        true
    }

    pub fn unregister(&mut self, viewer_id: &str) -> bool {
        self.viewers.remove(viewer_id).is_some()
    }

    /// Delivers `event` to every viewer. Viewers whose send fails, because they
    /// are gone or have stopped draining their queue, are evicted and the rest
    /// still receive the event. Returns the number delivered.
    pub fn broadcast(&mut self, event: &ViewerEvent) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;
        for (viewer_id, handle) in &self.viewers {
            match handle.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        session = %self.session_id,
                        viewer = %viewer_id,
                        kind = event.kind(),
                        error = %err,
                        "dropping viewer after failed send"
                    );
                    failed.push(viewer_id.clone());
                }
            }
        }
        for viewer_id in failed {
            if let Some(handle) = self.viewers.remove(&viewer_id) {
                handle.evict();
            }
        }
        delivered
    }

    /// Re-attaches surviving connections after revival without sending a
    /// replay. Handles for other sessions or already closed are skipped.
    pub fn recover<I>(&mut self, handles: I) -> usize
    where
        I: IntoIterator<Item = ViewerHandle>,
    {
        let mut recovered = 0;
        for handle in handles {
            if handle.session_id() != self.session_id || handle.is_closed() {
                continue;
            }
            self.viewers
                .insert(handle.viewer_id().to_string(), handle);
            recovered += 1;
        }
        if recovered > 0 {
            debug!(session = %self.session_id, recovered, "viewer registry rebuilt");
        }
        recovered
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }
}
