use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use trakx_core::clock::Clock;
use trakx_core::error::TrackerError;
use trakx_core::types::LockStatus;

use crate::provider::LockProvider;

/// An owned reservation on a lock name.
///
/// The handle wraps a backend reservation that must be released exactly
/// once: `release` is explicit and idempotent, and dropping an unreleased
/// handle fires a detached best-effort release so every exit path lets go
/// of the reservation.
pub struct SessionLock {
    resource: String,
    id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    lost: watch::Receiver<bool>,
    released: bool,
    provider: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("resource", &self.resource)
            .field("id", &self.id)
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .field("released", &self.released)
            .finish()
    }
}

impl SessionLock {
    pub(crate) fn new(
        resource: String,
        id: String,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        lost: Option<watch::Receiver<bool>>,
        provider: Arc<dyn LockProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lost = lost.unwrap_or_else(|| {
            // A provider without loss monitoring: a channel that never fires.
            let (_tx, rx) = watch::channel(false);
            rx
        });
        Self {
            resource,
            id,
            acquired_at,
            expires_at,
            lost,
            released: false,
            provider,
            clock,
        }
    }

    /// The lock name this handle reserves.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Owner tag, fresh per acquisition.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn status(&self) -> LockStatus {
        if self.released {
            LockStatus::Unlocked
        } else if self.clock.now() >= self.expires_at {
            LockStatus::Expired
        } else {
            LockStatus::Acquired
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.status() == LockStatus::Acquired
    }

    /// True once the backend reported it can no longer guarantee the hold.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// A receiver that flips to `true` when the hold can no longer be
    /// guaranteed. Loss is an observation, not an error; mutations made
    /// while lost are not rolled back.
    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    /// Releases the reservation. Safe to call any number of times; only the
    /// first call talks to the backend.
    pub async fn release(&mut self) -> Result<(), TrackerError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.provider.release(&self.resource, &self.id).await
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let provider = Arc::clone(&self.provider);
        let resource = std::mem::take(&mut self.resource);
        let id = std::mem::take(&mut self.id);
        // Without a runtime the reservation is left to its TTL.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = provider.release(&resource, &id).await {
                    warn!(resource = %resource, "dropped lock release failed: {e}");
                }
            });
        } else {
            warn!(resource = %resource, "lock dropped outside a runtime; reservation left to expire");
        }
    }
}
