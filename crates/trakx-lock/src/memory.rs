use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use trakx_core::clock::Clock;
use trakx_core::error::TrackerError;
use trakx_core::types::LockStatus;

use crate::provider::{AcquireOutcome, LockProvider};

struct HeldLock {
    id: String,
    expires_at: DateTime<Utc>,
    lost_tx: watch::Sender<bool>,
}

/// In-process lock provider: a shared set guarded by a local mutex.
///
/// The lost signal fires when an entry expires under a competing acquire or
/// is forcibly removed with [`break_lock`](Self::break_lock); a voluntary
/// release never fires it.
pub struct MemoryLockProvider {
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl MemoryLockProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Forcibly removes a reservation, firing its lost signal. Test hook
    /// standing in for an operator deleting the backend entry.
    pub fn break_lock(&self, resource: &str) {
        let mut held = self.held.lock().unwrap();
        if let Some(entry) = held.remove(resource) {
            let _ = entry.lost_tx.send(true);
        }
    }

    /// Current owner id, if any reservation is live. Test hook.
    pub fn owner(&self, resource: &str) -> Option<String> {
        let now = self.clock.now();
        let held = self.held.lock().unwrap();
        held.get(resource)
            .filter(|e| e.expires_at > now)
            .map(|e| e.id.clone())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, TrackerError> {
        let now = self.clock.now();
        let mut held = self.held.lock().unwrap();

        if let Some(entry) = held.get(resource) {
            if entry.expires_at > now {
                return Ok(AcquireOutcome::unavailable(LockStatus::Conflicted));
            }
            // Expired under its holder: the old owner lost the reservation.
            if let Some(stale) = held.remove(resource) {
                let _ = stale.lost_tx.send(true);
            }
        }

        let (lost_tx, lost_rx) = watch::channel(false);
        held.insert(
            resource.to_string(),
            HeldLock {
                id: id.to_string(),
                expires_at: now
                    + ChronoDuration::from_std(ttl).map_err(|e| {
                        TrackerError::InvalidOptions(format!("lock ttl out of range: {e}"))
                    })?,
                lost_tx,
            },
        );
        Ok(AcquireOutcome::acquired(lost_rx))
    }

    async fn release(&self, resource: &str, id: &str) -> Result<(), TrackerError> {
        let mut held = self.held.lock().unwrap();
        // Compare-and-delete: an alien id leaves the reservation alone.
        if held.get(resource).is_some_and(|e| e.id == id) {
            held.remove(resource);
        }
        Ok(())
    }
}
