use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::error::TargetError;
use crate::storage::Storage;

enum TargetSlot {
    /// Not read from storage since the session was (re)created.
    Unloaded,
    Loaded(Option<Url>),
}

/// Holds and persists the single forwarding target of a session.
pub struct TargetStore {
    session_id: String,
    storage: Storage,
    slot: Mutex<TargetSlot>,
}

impl TargetStore {
    pub fn new(session_id: String, storage: Storage) -> Self {
        Self {
            session_id,
            storage,
            slot: Mutex::new(TargetSlot::Unloaded),
        }
    }

    /// Validates and persists `address`. Storage is written before the cached
    /// value changes, so a failed write leaves the previous target in effect.
    pub async fn set(&self, address: &str) -> Result<Url, TargetError> {
        let url = validate_target(address)?;
        let mut slot = self.slot.lock().await;
        self.storage
            .set_target(&self.session_id, url.as_str())
            .await?;
        *slot = TargetSlot::Loaded(Some(url.clone()));
        info!(session = %self.session_id, target = %url, "target updated");
        Ok(url)
    }

    pub async fn get(&self) -> Result<Option<Url>, TargetError> {
        let mut slot = self.slot.lock().await;
        if let TargetSlot::Loaded(current) = &*slot {
            return Ok(current.clone());
        }

        let stored = self.storage.get_target(&self.session_id).await?;
        // A record that no longer parses is treated as unset.
        let loaded = stored.and_then(|raw| validate_target(&raw).ok());
        debug!(
            session = %self.session_id,
            configured = loaded.is_some(),
            "loaded target from storage"
        );
        *slot = TargetSlot::Loaded(loaded.clone());
        Ok(loaded)
    }
}

/// Accepts absolute http(s) URLs with a host.
pub fn validate_target(address: &str) -> Result<Url, TargetError> {
    let trimmed = address.trim();
    let invalid = |reason: String| TargetError::Invalid {
        address: address.to_string(),
        reason,
    };

    let url = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
