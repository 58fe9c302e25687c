use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

use trakx_core::error::TrackerError;
use trakx_core::types::LockStatus;

/// One attempt's worth of information from a provider.
#[derive(Debug)]
pub struct AcquireOutcome {
    pub status: LockStatus,
    /// Fires `true` when the backend can no longer guarantee the
    /// reservation is held. Present only on acquisition.
    pub lost: Option<watch::Receiver<bool>>,
}

impl AcquireOutcome {
    pub fn acquired(lost: watch::Receiver<bool>) -> Self {
        Self {
            status: LockStatus::Acquired,
            lost: Some(lost),
        }
    }

    pub fn unavailable(status: LockStatus) -> Self {
        Self { status, lost: None }
    }
}

/// Backend-specific lock protocol behind a uniform contract.
///
/// `try_acquire` is a single non-blocking reservation attempt; polling and
/// wait budgets live in the coordinator. `release` must be idempotent and
/// must leave the reservation alone when `id` does not match the stored
/// owner.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn try_acquire(
        &self,
        resource: &str,
        id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, TrackerError>;

    async fn release(&self, resource: &str, id: &str) -> Result<(), TrackerError>;
}
