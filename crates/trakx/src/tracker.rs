use redis::aio::ConnectionManager;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trakx_core::clock::{Clock, SystemClock};
use trakx_core::error::{StartError, TrackerError};
use trakx_core::keys::KeyNamer;
use trakx_core::settings::TrackerSettings;
use trakx_core::types::{Session, SessionKey, SessionType};
use trakx_engine::backend::{RedisBackend, ScriptBackend};
use trakx_engine::engine::CompartmentEngine;
use trakx_engine::memory::MemoryBackend;
use trakx_lock::coordinator::LockCoordinator;
use trakx_lock::handle::SessionLock;
use trakx_lock::memory::MemoryLockProvider;
use trakx_lock::provider::LockProvider;
use trakx_lock::redis::RedisLockProvider;

use crate::policy::PolicyResolver;

/// A session together with the advisory lock guarding it.
pub struct LockedSession<P> {
    pub session: Session<P>,
    pub lock: SessionLock,
}

impl<P: fmt::Debug> fmt::Debug for LockedSession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedSession")
            .field("session", &self.session)
            .field("lock", &self.lock)
            .finish()
    }
}

// ── SessionTracker ────────────────────────────────────────────────────────────

/// The user-facing orchestrator: policy resolution, version bumping, and the
/// combined lock-then-get flow over the compartment engine and the lock
/// coordinator.
///
/// Cheap to clone; all shared state is immutable after construction, so a
/// tracker handle is safe for unbounded parallel callers.
#[derive(Clone)]
pub struct SessionTracker {
    engine: CompartmentEngine,
    locks: LockCoordinator,
    resolver: PolicyResolver,
    namer: KeyNamer,
}

impl SessionTracker {
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    /// Redis-backed tracker: engine scripts and the single-node lock
    /// protocol share one multiplexed connection.
    pub async fn connect(url: &str, settings: TrackerSettings) -> Result<Self, TrackerError> {
        let client =
            redis::Client::open(url).map_err(|e| TrackerError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TrackerError::Backend(e.to_string()))?;
        let backend = Arc::new(RedisBackend::new(conn.clone(), &settings));
        let lock_provider = Arc::new(RedisLockProvider::new(conn));
        TrackerBuilder::new()
            .settings(settings)
            .backend(backend)
            .lock_provider(lock_provider)
            .build()
    }

    /// Tracker over the in-process backend and lock table. Single-process
    /// deployments and tests.
    pub fn in_memory(settings: TrackerSettings, clock: Arc<dyn Clock>) -> Result<Self, TrackerError> {
        TrackerBuilder::new()
            .settings(settings)
            .backend(Arc::new(MemoryBackend::new(clock.clone())))
            .lock_provider(Arc::new(MemoryLockProvider::new(clock.clone())))
            .clock(clock)
            .build()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Creates the session in the active compartment under the type's active
    /// policy. The losing side of a concurrent start gets the decoded winner
    /// back in [`StartError::AlreadyStarted`].
    pub async fn start<P: fmt::Debug>(
        &self,
        ty: &SessionType<P>,
        session: &mut Session<P>,
        cancel: &CancellationToken,
    ) -> Result<(), StartError<P>> {
        let policy = self.resolver.resolve(ty.name())?;
        self.engine.add(ty, session, &policy.active, cancel).await
    }

    pub async fn get<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        self.engine.get(ty, key, cancel).await
    }

    pub async fn refresh<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        self.engine.refresh(ty, key, cancel).await
    }

    /// By-session variant of [`refresh`](Self::refresh).
    pub async fn refresh_session<P>(
        &self,
        ty: &SessionType<P>,
        session: &Session<P>,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        self.engine.refresh(ty, &session.key, cancel).await
    }

    /// Bumps `version`, then replaces the stored payload. The bump happens
    /// before the engine call, so a failed update leaves the caller's copy
    /// one ahead of the store; the stored version only moves on success.
    pub async fn update<P>(
        &self,
        ty: &SessionType<P>,
        session: &mut Session<P>,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        session.version += 1;
        self.engine.update(ty, session, cancel).await
    }

    /// As [`update`](Self::update), returning the stored post-update value.
    pub async fn update_and_get<P>(
        &self,
        ty: &SessionType<P>,
        session: &mut Session<P>,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        session.version += 1;
        self.engine.update_and_get(ty, session, cancel).await
    }

    /// Moves the session to the evicted compartment under the type's evicted
    /// policy.
    pub async fn finish<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let policy = self.resolver.resolve(ty.name())?;
        self.engine.evict(ty, key, &policy.evicted, cancel).await
    }

    /// By-session variant of [`finish`](Self::finish). Evicts, exactly like
    /// the by-key variant.
    pub async fn finish_session<P>(
        &self,
        ty: &SessionType<P>,
        session: &Session<P>,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        self.finish(ty, &session.key, cancel).await
    }

    /// As [`finish`](Self::finish), returning the moved value.
    pub async fn finish_and_get<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        let policy = self.resolver.resolve(ty.name())?;
        self.engine
            .evict_and_get(ty, key, &policy.evicted, cancel)
            .await
    }

    /// Brings an evicted session back to the active compartment under the
    /// type's active policy.
    pub async fn resume<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let policy = self.resolver.resolve(ty.name())?;
        self.engine.restore(ty, key, &policy.active, cancel).await
    }

    /// As [`resume`](Self::resume), returning the moved value.
    pub async fn resume_and_get<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        let policy = self.resolver.resolve(ty.name())?;
        self.engine
            .restore_and_get(ty, key, &policy.active, cancel)
            .await
    }

    pub async fn get_evicted<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        self.engine.get_evicted(ty, key, cancel).await
    }

    // ── Locking ──────────────────────────────────────────────────────────────

    /// Single-shot lock attempt with the type's lock TTL.
    pub async fn lock_once<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
    ) -> Result<SessionLock, TrackerError> {
        let policy = self.resolver.resolve(ty.name())?;
        let resource = self.namer.lock_name(ty.name(), key);
        self.locks.acquire_once(&resource, policy.lock_ttl).await
    }

    /// Waiting lock acquisition with the type's TTL, wait budget, and retry
    /// cadence.
    pub async fn lock<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<SessionLock, TrackerError> {
        let policy = self.resolver.resolve(ty.name())?;
        self.lock_with(ty, key, policy.lock_ttl, policy.lock_wait, policy.lock_retry, cancel)
            .await
    }

    /// Waiting lock acquisition with explicit timing.
    pub async fn lock_with<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        ttl: Duration,
        wait: Duration,
        retry: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionLock, TrackerError> {
        let resource = self.namer.lock_name(ty.name(), key);
        self.locks
            .acquire(&resource, ttl, wait, retry, cancel)
            .await
    }

    /// Acquires the session's lock, then fetches it. If the fetch fails the
    /// lock is released before the error propagates.
    pub async fn get_locked<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<LockedSession<P>, TrackerError> {
        let mut lock = self.lock(ty, key, cancel).await?;
        match self.get(ty, key, cancel).await {
            Ok(session) => Ok(LockedSession { session, lock }),
            Err(e) => {
                if let Err(release_err) = lock.release().await {
                    warn!(key = %key, "releasing lock after failed get: {release_err}");
                }
                Err(e)
            }
        }
    }
}

// ── TrackerBuilder ────────────────────────────────────────────────────────────

/// Wires settings, backend, lock provider, and clock into a tracker.
pub struct TrackerBuilder {
    settings: TrackerSettings,
    backend: Option<Arc<dyn ScriptBackend>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    clock: Arc<dyn Clock>,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self {
            settings: TrackerSettings::default(),
            backend: None,
            lock_provider: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn settings(mut self, settings: TrackerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ScriptBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<SessionTracker, TrackerError> {
        let backend = self.backend.ok_or_else(|| {
            TrackerError::InvalidOptions("a script backend is required".into())
        })?;
        let lock_provider = self.lock_provider.ok_or_else(|| {
            TrackerError::InvalidOptions("a lock provider is required".into())
        })?;
        let namer = KeyNamer::new(
            self.settings.key_prefix.as_str(),
            self.settings.lock_prefix.as_str(),
        );
        let engine = CompartmentEngine::new(backend, namer.clone(), self.clock.clone());
        let locks = LockCoordinator::new(lock_provider, self.clock.clone());
        info!(
            key_prefix = %self.settings.key_prefix,
            proxy_optimisation = self.settings.use_proxy_optimisation,
            "session tracker ready"
        );
        Ok(SessionTracker {
            engine,
            locks,
            resolver: PolicyResolver::new(self.settings),
            namer,
        })
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
