use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use trakx_core::clock::Clock;
use trakx_core::error::TrackerError;
use trakx_core::types::LockStatus;

use crate::handle::SessionLock;
use crate::provider::LockProvider;

/// Serializes cross-process mutations on a session key.
///
/// Locks are advisory: the compartment engine never checks them. The
/// coordinator owns acquisition policy — fresh owner tags, the wait budget
/// measured on the injected clock, and the retry cadence — while the
/// protocol itself lives in the provider.
#[derive(Clone)]
pub struct LockCoordinator {
    provider: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
}

impl LockCoordinator {
    pub fn new(provider: Arc<dyn LockProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { provider, clock }
    }

    pub fn provider(&self) -> &Arc<dyn LockProvider> {
        &self.provider
    }

    /// Single non-blocking attempt.
    pub async fn acquire_once(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<SessionLock, TrackerError> {
        let id = Uuid::new_v4().to_string();
        let outcome = self.provider.try_acquire(resource, &id, ttl).await?;
        if outcome.status != LockStatus::Acquired {
            return Err(TrackerError::LockNotAcquired(outcome.status));
        }
        let acquired_at = self.clock.now();
        let expires_at = acquired_at
            + ChronoDuration::from_std(ttl)
                .map_err(|e| TrackerError::InvalidOptions(format!("lock ttl out of range: {e}")))?;
        debug!(resource, id = %id, "lock acquired");
        Ok(SessionLock::new(
            resource.to_string(),
            id,
            acquired_at,
            expires_at,
            outcome.lost,
            Arc::clone(&self.provider),
            Arc::clone(&self.clock),
        ))
    }

    /// Polls every `retry` until the lock is acquired, the `wait` budget
    /// elapses, or `cancel` trips. The budget is wall-clock time on the
    /// injected clock, checked between iterations.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
        retry: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionLock, TrackerError> {
        if cancel.is_cancelled() {
            return Err(TrackerError::Cancelled);
        }
        let deadline = self.clock.now()
            + ChronoDuration::from_std(wait)
                .map_err(|e| TrackerError::InvalidOptions(format!("lock wait out of range: {e}")))?;

        let mut last_status = LockStatus::Conflicted;
        loop {
            match self.acquire_once(resource, ttl).await {
                Ok(lock) => return Ok(lock),
                Err(TrackerError::LockNotAcquired(status)) => last_status = status,
                Err(other) => return Err(other),
            }

            if self.clock.now() >= deadline {
                debug!(resource, "lock wait budget exhausted");
                return Err(TrackerError::LockNotAcquired(last_status));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TrackerError::Cancelled),
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockProvider;
    use std::time::Instant;
    use trakx_core::clock::SystemClock;

    fn coordinator() -> (LockCoordinator, Arc<MemoryLockProvider>) {
        let clock = Arc::new(SystemClock);
        let provider = Arc::new(MemoryLockProvider::new(clock.clone()));
        (
            LockCoordinator::new(
                Arc::clone(&provider) as Arc<dyn LockProvider>,
                clock,
            ),
            provider,
        )
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn acquire_and_scoped_release() {
        let (coordinator, provider) = coordinator();
        let mut lock = coordinator.acquire_once("r", TTL).await.unwrap();
        assert!(lock.is_acquired());
        assert_eq!(provider.owner("r").as_deref(), Some(lock.id()));

        lock.release().await.unwrap();
        assert_eq!(lock.status(), LockStatus::Unlocked);
        assert_eq!(provider.owner("r"), None);

        // Releasing again is a no-op.
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_times_out_with_conflicted() {
        let (coordinator, _provider) = coordinator();
        let _held = coordinator.acquire_once("r", TTL).await.unwrap();

        let started = Instant::now();
        let err = coordinator
            .acquire(
                "r",
                TTL,
                Duration::from_millis(200),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::LockNotAcquired(LockStatus::Conflicted));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "gave up early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "gave up late: {elapsed:?}");
    }

    #[tokio::test]
    async fn waiting_acquire_wins_when_the_holder_lets_go() {
        let (coordinator, _provider) = coordinator();
        let held = coordinator.acquire_once("r", TTL).await.unwrap();

        let waiter = coordinator.clone();
        let task = tokio::spawn(async move {
            waiter
                .acquire(
                    "r",
                    TTL,
                    Duration::from_secs(2),
                    Duration::from_millis(50),
                    &CancellationToken::new(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut held = held;
        held.release().await.unwrap();

        let lock = task.await.unwrap().unwrap();
        assert!(lock.is_acquired());
    }

    #[tokio::test]
    async fn cancellation_returns_within_one_retry_interval() {
        let (coordinator, _provider) = coordinator();
        let _held = coordinator.acquire_once("r", TTL).await.unwrap();

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trip.cancel();
        });

        let started = Instant::now();
        let err = coordinator
            .acquire(
                "r",
                TTL,
                Duration::from_secs(10),
                Duration::from_millis(200),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_in_the_background() {
        let (coordinator, provider) = coordinator();
        let lock = coordinator.acquire_once("r", TTL).await.unwrap();
        drop(lock);

        // The detached release runs on the runtime; poll briefly.
        for _ in 0..20 {
            if provider.owner("r").is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("dropped lock was never released");
    }

    #[tokio::test]
    async fn expired_handle_reports_expired() {
        let (coordinator, _provider) = coordinator();
        let lock = coordinator
            .acquire_once("r", Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(lock.status(), LockStatus::Expired);
    }
}
