use chrono::{DateTime, Utc};
use redis::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trakx_core::clock::Clock;
use trakx_core::constants::{NO_EXPIRY, OTHER_COMPARTMENT_SENTINEL, UNIT_SENTINEL};
use trakx_core::error::{StartError, TrackerError};
use trakx_core::keys::KeyNamer;
use trakx_core::options::SessionEntryOptions;
use trakx_core::types::{Session, SessionKey, SessionType};

use crate::backend::ScriptBackend;
use crate::scripts::{ScriptName, SCRIPTS};

// ── CompartmentEngine ─────────────────────────────────────────────────────────

/// The two-compartment state machine over the script backend.
///
/// Every operation is one server-evaluated script, so for a given
/// (type, user key) pair the observable state is always exactly one of
/// {absent, active, evicted} and each call is linearizable on that pair.
/// The engine never inspects `version`; that is facade business.
#[derive(Clone)]
pub struct CompartmentEngine {
    backend: Arc<dyn ScriptBackend>,
    namer: KeyNamer,
    clock: Arc<dyn Clock>,
}

/// absexp unix seconds, sldexp seconds, effective ttl seconds; -1 when unset.
fn expiry_args(options: &SessionEntryOptions, now: DateTime<Utc>) -> (i64, i64, i64) {
    let absexp = options
        .resolve_absolute(now)
        .map_or(NO_EXPIRY, |at| at.timestamp());
    let sldexp = options
        .sliding_expiration()
        .map_or(NO_EXPIRY, |d| d.as_secs() as i64);
    let ttl = options.expiration_seconds(now).unwrap_or(NO_EXPIRY);
    (absexp, sldexp, ttl)
}

fn num_arg(n: i64) -> Vec<u8> {
    n.to_string().into_bytes()
}

fn flag_arg(set: bool) -> Vec<u8> {
    if set { b"1".to_vec() } else { b"0".to_vec() }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), TrackerError> {
    if cancel.is_cancelled() {
        return Err(TrackerError::Cancelled);
    }
    Ok(())
}

/// What `'-1'` means for the operation at hand.
#[derive(Clone, Copy)]
enum OtherCompartment {
    Evicted,
    Restored,
}

impl OtherCompartment {
    fn error(self) -> TrackerError {
        match self {
            OtherCompartment::Evicted => TrackerError::AlreadyEvicted,
            OtherCompartment::Restored => TrackerError::AlreadyRestored,
        }
    }
}

fn classify_unit(
    value: Value,
    key: &SessionKey,
    other: OtherCompartment,
) -> Result<(), TrackerError> {
    match value {
        Value::Nil => Err(TrackerError::NotFound(key.clone())),
        Value::Data(bytes) if bytes == OTHER_COMPARTMENT_SENTINEL.as_bytes() => {
            Err(other.error())
        }
        Value::Data(bytes) if bytes == UNIT_SENTINEL.as_bytes() => Ok(()),
        Value::Int(1) => Ok(()),
        unexpected => Err(TrackerError::UnexpectedBackendResult(format!(
            "{unexpected:?}"
        ))),
    }
}

fn classify_data(
    value: Value,
    key: &SessionKey,
    other: OtherCompartment,
) -> Result<Vec<u8>, TrackerError> {
    match value {
        Value::Nil => Err(TrackerError::NotFound(key.clone())),
        Value::Data(bytes) if bytes == OTHER_COMPARTMENT_SENTINEL.as_bytes() => {
            Err(other.error())
        }
        Value::Data(bytes) => Ok(bytes),
        unexpected => Err(TrackerError::UnexpectedBackendResult(format!(
            "{unexpected:?}"
        ))),
    }
}

impl CompartmentEngine {
    pub fn new(backend: Arc<dyn ScriptBackend>, namer: KeyNamer, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            namer,
            clock,
        }
    }

    // ── Add ──────────────────────────────────────────────────────────────────

    /// Creates the session in the active compartment if neither compartment
    /// holds its key. On the losing side of a race the decoded winner comes
    /// back in [`StartError::AlreadyStarted`]. Fills in both provider keys
    /// on success.
    pub async fn add<P: fmt::Debug>(
        &self,
        ty: &SessionType<P>,
        session: &mut Session<P>,
        options: &SessionEntryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StartError<P>> {
        check_cancelled(cancel)?;
        let active = self.namer.active_key(ty.name(), &session.key);
        let evicted = self.namer.evicted_key(ty.name(), &session.key);
        let now = self.clock.now();
        let (absexp, sldexp, ttl) = expiry_args(options, now);

        // Stored payloads carry their own provider keys; roll back if the
        // write does not go through.
        let prior_active = session.active_provider_key.take();
        let prior_evicted = session.evicted_provider_key.take();
        session.active_provider_key = Some(active.clone());
        session.evicted_provider_key = Some(evicted.clone());

        let result = self
            .add_inner(ty, session, [active, evicted], absexp, sldexp, ttl)
            .await;
        if result.is_err() {
            session.active_provider_key = prior_active;
            session.evicted_provider_key = prior_evicted;
        }
        result
    }

    async fn add_inner<P: fmt::Debug>(
        &self,
        ty: &SessionType<P>,
        session: &Session<P>,
        keys: [String; 2],
        absexp: i64,
        sldexp: i64,
        ttl: i64,
    ) -> Result<(), StartError<P>> {
        let payload = ty.codec().encode(session)?;
        let value = self
            .backend
            .eval(
                SCRIPTS.get(ScriptName::AddIfAbsent),
                &keys,
                &[payload, num_arg(absexp), num_arg(sldexp), num_arg(ttl)],
            )
            .await?;
        debug!(ty = ty.name(), key = %session.key, "add session");

        match value {
            Value::Data(bytes) if bytes == UNIT_SENTINEL.as_bytes() => Ok(()),
            Value::Int(1) => Ok(()),
            Value::Data(bytes) if bytes == OTHER_COMPARTMENT_SENTINEL.as_bytes() => {
                Err(StartError::Tracker(TrackerError::AlreadyEvicted))
            }
            Value::Data(existing) => {
                let winner = ty.codec().decode(&existing)?;
                Err(StartError::AlreadyStarted(winner))
            }
            unexpected => Err(StartError::Tracker(TrackerError::UnexpectedBackendResult(
                format!("{unexpected:?}"),
            ))),
        }
    }

    // ── Get / Refresh ────────────────────────────────────────────────────────

    /// Fetches the active entry, re-arming its sliding window.
    pub async fn get<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        let bytes = self
            .read_primary(ty.name(), key, true, true, cancel)
            .await?;
        ty.codec().decode(&bytes)
    }

    /// Re-arms the sliding window without fetching.
    pub async fn refresh<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        check_cancelled(cancel)?;
        let keys = [
            self.namer.active_key(ty.name(), key),
            self.namer.evicted_key(ty.name(), key),
        ];
        let now = self.clock.now().timestamp();
        let value = self
            .backend
            .eval(
                SCRIPTS.get(ScriptName::GetAndRefresh),
                &keys,
                &[num_arg(now), flag_arg(false), flag_arg(true)],
            )
            .await?;
        debug!(ty = ty.name(), key = %key, "refresh session");
        classify_unit(value, key, OtherCompartment::Evicted)
    }

    /// Fetches the evicted entry. Does not touch its TTL.
    pub async fn get_evicted<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        check_cancelled(cancel)?;
        let keys = [
            self.namer.evicted_key(ty.name(), key),
            self.namer.active_key(ty.name(), key),
        ];
        let now = self.clock.now().timestamp();
        let value = self
            .backend
            .eval(
                SCRIPTS.get(ScriptName::GetAndRefresh),
                &keys,
                &[num_arg(now), flag_arg(true), flag_arg(false)],
            )
            .await?;
        debug!(ty = ty.name(), key = %key, "get evicted session");
        let bytes = classify_data(value, key, OtherCompartment::Restored)?;
        ty.codec().decode(&bytes)
    }

    async fn read_primary(
        &self,
        type_name: &str,
        key: &SessionKey,
        return_data: bool,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TrackerError> {
        check_cancelled(cancel)?;
        let keys = [
            self.namer.active_key(type_name, key),
            self.namer.evicted_key(type_name, key),
        ];
        let now = self.clock.now().timestamp();
        let value = self
            .backend
            .eval(
                SCRIPTS.get(ScriptName::GetAndRefresh),
                &keys,
                &[num_arg(now), flag_arg(return_data), flag_arg(refresh)],
            )
            .await?;
        debug!(ty = type_name, key = %key, "get session");
        classify_data(value, key, OtherCompartment::Evicted)
    }

    // ── Update ───────────────────────────────────────────────────────────────

    /// Replaces the active payload, re-arming the sliding window.
    pub async fn update<P>(
        &self,
        ty: &SessionType<P>,
        session: &Session<P>,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let value = self.update_inner(ty, session, false, cancel).await?;
        classify_unit(value, &session.key, OtherCompartment::Evicted)
    }

    /// As [`update`](Self::update), returning the stored post-update value.
    pub async fn update_and_get<P>(
        &self,
        ty: &SessionType<P>,
        session: &Session<P>,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        let value = self.update_inner(ty, session, true, cancel).await?;
        let bytes = classify_data(value, &session.key, OtherCompartment::Evicted)?;
        ty.codec().decode(&bytes)
    }

    async fn update_inner<P>(
        &self,
        ty: &SessionType<P>,
        session: &Session<P>,
        return_data: bool,
        cancel: &CancellationToken,
    ) -> Result<Value, TrackerError> {
        check_cancelled(cancel)?;
        let keys = [
            self.namer.active_key(ty.name(), &session.key),
            self.namer.evicted_key(ty.name(), &session.key),
        ];
        let payload = ty.codec().encode(session)?;
        let now = self.clock.now().timestamp();
        let value = self
            .backend
            .eval(
                SCRIPTS.get(ScriptName::UpdateIfPresent),
                &keys,
                &[payload, num_arg(now), flag_arg(return_data)],
            )
            .await?;
        debug!(ty = ty.name(), key = %session.key, version = session.version, "update session");
        Ok(value)
    }

    // ── Evict / Restore ──────────────────────────────────────────────────────

    /// Moves the active entry into the evicted compartment under the evicted
    /// policy.
    pub async fn evict<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        evicted_options: &SessionEntryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let value = self
            .move_entry(ty.name(), key, evicted_options, false, false, cancel)
            .await?;
        classify_unit(value, key, OtherCompartment::Evicted)
    }

    /// As [`evict`](Self::evict), returning the moved value.
    pub async fn evict_and_get<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        evicted_options: &SessionEntryOptions,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        let value = self
            .move_entry(ty.name(), key, evicted_options, false, true, cancel)
            .await?;
        let bytes = classify_data(value, key, OtherCompartment::Evicted)?;
        ty.codec().decode(&bytes)
    }

    /// Moves the evicted entry back into the active compartment under the
    /// active policy.
    pub async fn restore<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        active_options: &SessionEntryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let value = self
            .move_entry(ty.name(), key, active_options, true, false, cancel)
            .await?;
        classify_unit(value, key, OtherCompartment::Restored)
    }

    /// As [`restore`](Self::restore), returning the moved value.
    pub async fn restore_and_get<P>(
        &self,
        ty: &SessionType<P>,
        key: &SessionKey,
        active_options: &SessionEntryOptions,
        cancel: &CancellationToken,
    ) -> Result<Session<P>, TrackerError> {
        let value = self
            .move_entry(ty.name(), key, active_options, true, true, cancel)
            .await?;
        let bytes = classify_data(value, key, OtherCompartment::Restored)?;
        ty.codec().decode(&bytes)
    }

    async fn move_entry(
        &self,
        type_name: &str,
        key: &SessionKey,
        options: &SessionEntryOptions,
        to_active: bool,
        return_data: bool,
        cancel: &CancellationToken,
    ) -> Result<Value, TrackerError> {
        check_cancelled(cancel)?;
        let active = self.namer.active_key(type_name, key);
        let evicted = self.namer.evicted_key(type_name, key);
        let (keys, script) = if to_active {
            ([evicted, active], ScriptName::MoveEvictedToActive)
        } else {
            ([active, evicted], ScriptName::MoveActiveToEvicted)
        };
        let now = self.clock.now();
        let (absexp, sldexp, ttl) = expiry_args(options, now);
        let value = self
            .backend
            .eval(
                SCRIPTS.get(script),
                &keys,
                &[
                    num_arg(absexp),
                    num_arg(sldexp),
                    num_arg(ttl),
                    flag_arg(return_data),
                ],
            )
            .await?;
        debug!(ty = type_name, key = %key, to_active, "move session");
        Ok(value)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use trakx_core::clock::ManualClock;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Checkout {
        total: u32,
    }

    struct Fixture {
        engine: CompartmentEngine,
        clock: Arc<ManualClock>,
        ty: SessionType<Checkout>,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let engine = CompartmentEngine::new(backend, KeyNamer::default(), clock.clone());
        Fixture {
            engine,
            clock,
            ty: SessionType::json("checkout"),
            cancel: CancellationToken::new(),
        }
    }

    fn options(absolute_secs: u64, sliding_secs: u64) -> SessionEntryOptions {
        let mut opts = SessionEntryOptions::new();
        opts.set_absolute_expiration_relative_to_now(Duration::from_secs(absolute_secs))
            .unwrap();
        opts.set_sliding_expiration(Duration::from_secs(sliding_secs))
            .unwrap();
        opts
    }

    fn session(f: &Fixture, key: &str, total: u32) -> Session<Checkout> {
        Session::new(key, Checkout { total }, &*f.clock)
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let f = fixture();
        let mut s = session(&f, "k1", 7);
        f.engine
            .add(&f.ty, &mut s, &options(30, 10), &f.cancel)
            .await
            .unwrap();
        assert_eq!(
            s.active_provider_key.as_deref(),
            Some("session-tracker:checkout:k1")
        );
        assert_eq!(
            s.evicted_provider_key.as_deref(),
            Some("session-tracker:evicted:checkout:k1")
        );

        let fetched = f
            .engine
            .get(&f.ty, &s.key, &f.cancel)
            .await
            .unwrap();
        assert_eq!(fetched, s);
        assert_eq!(fetched.version, 1);
        assert_eq!(fetched.payload, Checkout { total: 7 });
    }

    #[tokio::test]
    async fn second_add_loses_and_sees_the_winner() {
        let f = fixture();
        let mut first = session(&f, "k1", 1);
        f.engine
            .add(&f.ty, &mut first, &options(30, 10), &f.cancel)
            .await
            .unwrap();

        let mut second = session(&f, "k1", 2);
        let err = f
            .engine
            .add(&f.ty, &mut second, &options(30, 10), &f.cancel)
            .await
            .unwrap_err();
        match err {
            StartError::AlreadyStarted(winner) => {
                assert_eq!(winner.payload, Checkout { total: 1 })
            }
            other => panic!("expected AlreadyStarted, got {other:?}"),
        }
        // The loser keeps unset provider keys.
        assert!(second.active_provider_key.is_none());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let f = fixture();
        let err = f
            .engine
            .get(&f.ty, &SessionKey::from("absent"), &f.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn mutating_an_evicted_session_reports_already_evicted() {
        let f = fixture();
        let mut s = session(&f, "k1", 1);
        f.engine
            .add(&f.ty, &mut s, &options(30, 10), &f.cancel)
            .await
            .unwrap();
        f.engine
            .evict(&f.ty, &s.key, &options(30, 10), &f.cancel)
            .await
            .unwrap();

        let err = f.engine.update(&f.ty, &s, &f.cancel).await.unwrap_err();
        assert_eq!(err, TrackerError::AlreadyEvicted);

        let err = f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap_err();
        assert_eq!(err, TrackerError::AlreadyEvicted);

        let err = f.engine.refresh(&f.ty, &s.key, &f.cancel).await.unwrap_err();
        assert_eq!(err, TrackerError::AlreadyEvicted);
    }

    #[tokio::test]
    async fn evict_restore_cycle() {
        let f = fixture();
        let mut s = session(&f, "k1", 5);
        f.engine
            .add(&f.ty, &mut s, &options(30, 10), &f.cancel)
            .await
            .unwrap();
        f.engine
            .evict(&f.ty, &s.key, &options(60, 20), &f.cancel)
            .await
            .unwrap();

        let parked = f
            .engine
            .get_evicted(&f.ty, &s.key, &f.cancel)
            .await
            .unwrap();
        assert_eq!(parked.payload, Checkout { total: 5 });

        f.engine
            .restore(&f.ty, &s.key, &options(30, 10), &f.cancel)
            .await
            .unwrap();
        let err = f
            .engine
            .get_evicted(&f.ty, &s.key, &f.cancel)
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::AlreadyRestored);

        // And the restored entry is readable as active again.
        let back = f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap();
        assert_eq!(back.payload, Checkout { total: 5 });
    }

    #[tokio::test]
    async fn restore_of_missing_key_is_not_found() {
        let f = fixture();
        let err = f
            .engine
            .restore(
                &f.ty,
                &SessionKey::from("ghost"),
                &options(30, 10),
                &f.cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_and_get_returns_the_stored_copy() {
        let f = fixture();
        let mut s = session(&f, "k1", 1);
        f.engine
            .add(&f.ty, &mut s, &options(30, 10), &f.cancel)
            .await
            .unwrap();

        s.payload.total = 9;
        s.version += 1;
        let stored = f
            .engine
            .update_and_get(&f.ty, &s, &f.cancel)
            .await
            .unwrap();
        assert_eq!(stored.payload, Checkout { total: 9 });
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn sliding_reads_keep_the_entry_alive() {
        let f = fixture();
        let mut s = session(&f, "k1", 1);
        f.engine
            .add(&f.ty, &mut s, &options(30, 10), &f.cancel)
            .await
            .unwrap();

        // Each read lands inside the 10 s window and re-arms it.
        for _ in 0..2 {
            f.clock.advance(Duration::from_secs(8));
            f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap();
        }

        // Going quiet past the window expires the entry.
        f.clock.advance(Duration::from_secs(11));
        let err = f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn sliding_refresh_cannot_outlive_the_absolute_bound() {
        let f = fixture();
        let mut s = session(&f, "k1", 1);
        f.engine
            .add(&f.ty, &mut s, &options(30, 10), &f.cancel)
            .await
            .unwrap();

        // 25 s in: refresh is capped at the 5 s left on the absolute bound.
        f.clock.advance(Duration::from_secs(8));
        f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap();
        f.clock.advance(Duration::from_secs(8));
        f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap();
        f.clock.advance(Duration::from_secs(9));
        f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap();

        f.clock.advance(Duration::from_secs(6));
        let err = f.engine.get(&f.ty, &s.key, &f.cancel).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let f = fixture();
        f.cancel.cancel();
        let err = f
            .engine
            .get(&f.ty, &SessionKey::from("k"), &f.cancel)
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::Cancelled);
    }

    #[tokio::test]
    async fn unexpected_shapes_are_surfaced() {
        struct WeirdBackend;

        #[async_trait::async_trait]
        impl ScriptBackend for WeirdBackend {
            async fn eval(
                &self,
                _script: &crate::scripts::LuaScript,
                _keys: &[String],
                _args: &[Vec<u8>],
            ) -> Result<Value, TrackerError> {
                Ok(Value::Bulk(vec![]))
            }
        }

        let clock = Arc::new(ManualClock::starting_at(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let engine = CompartmentEngine::new(
            Arc::new(WeirdBackend),
            KeyNamer::default(),
            clock,
        );
        let ty: SessionType<Checkout> = SessionType::json("checkout");
        let err = engine
            .get(&ty, &SessionKey::from("k"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::UnexpectedBackendResult(_)));
    }
}
