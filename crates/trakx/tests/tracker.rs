//! End-to-end scenarios for the session tracker.
//!
//! Runs the full facade → engine → backend stack over the in-process
//! backend and lock table, so the suite needs no external services. State
//! machine scenarios use a manual clock; lock timing scenarios run on the
//! system clock with compressed durations.
//!
//! Run with:
//!   cargo test -p trakx --test tracker

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use trakx::{
    LockStatus, ManualClock, Session, SessionKey, SessionTracker, SessionType, StartError,
    SystemClock, TrackerError, TrackerSettings,
};

// ── Fixtures ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    a: u32,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".parse().unwrap()),
            )
            .with_test_writer()
            .try_init();
    });
}

fn manual_tracker() -> (SessionTracker, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::starting_at(
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    ));
    let tracker = SessionTracker::in_memory(TrackerSettings::default(), clock.clone())
        .expect("build tracker");
    (tracker, clock)
}

fn system_tracker() -> SessionTracker {
    init_tracing();
    SessionTracker::in_memory(TrackerSettings::default(), Arc::new(SystemClock))
        .expect("build tracker")
}

fn order_type() -> SessionType<Order> {
    SessionType::json("order")
}

// ── State machine scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn add_on_empty_backend_then_get() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();

    let fetched = tracker
        .get(&ty, &SessionKey::from("k"), &cancel)
        .await
        .unwrap();
    assert_eq!(fetched.payload, Order { a: 1 });
    assert_eq!(fetched.version, 1);
    assert!(fetched.active_provider_key.is_some());
    assert!(fetched.evicted_provider_key.is_some());
}

#[tokio::test]
async fn concurrent_second_add_gets_the_winner_back() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut first = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut first, &cancel).await.unwrap();

    let mut second = Session::new("k", Order { a: 2 }, &*clock);
    let err = tracker.start(&ty, &mut second, &cancel).await.unwrap_err();
    match err {
        StartError::AlreadyStarted(winner) => assert_eq!(winner.payload, Order { a: 1 }),
        other => panic!("expected AlreadyStarted, got {other:?}"),
    }
}

#[tokio::test]
async fn update_after_finish_reports_already_evicted() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();
    tracker.finish(&ty, &session.key, &cancel).await.unwrap();

    session.payload.a = 2;
    let err = tracker.update(&ty, &mut session, &cancel).await.unwrap_err();
    assert_eq!(err, TrackerError::AlreadyEvicted);
}

#[tokio::test]
async fn finish_resume_round_trip() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    let key = SessionKey::from("k");

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();
    tracker.finish(&ty, &key, &cancel).await.unwrap();

    let parked = tracker.get_evicted(&ty, &key, &cancel).await.unwrap();
    assert_eq!(parked.payload, Order { a: 1 });

    tracker.resume(&ty, &key, &cancel).await.unwrap();
    let err = tracker.get_evicted(&ty, &key, &cancel).await.unwrap_err();
    assert_eq!(err, TrackerError::AlreadyRestored);
}

#[tokio::test]
async fn finish_evicts_for_both_variants() {
    // The by-session variant moves the entry out of the active compartment
    // just like the by-key one; neither leaves it refreshable in place.
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();
    tracker
        .finish_session(&ty, &session, &cancel)
        .await
        .unwrap();

    let err = tracker
        .refresh(&ty, &session.key, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, TrackerError::AlreadyEvicted);

    let parked = tracker
        .get_evicted(&ty, &session.key, &cancel)
        .await
        .unwrap();
    assert_eq!(parked.payload, Order { a: 1 });
}

#[tokio::test]
async fn version_increases_by_one_per_update() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut session = Session::new("k", Order { a: 0 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();

    for expected in 2..=5 {
        session.payload.a += 1;
        let stored = tracker
            .update_and_get(&ty, &mut session, &cancel)
            .await
            .unwrap();
        assert_eq!(stored.version, expected);
        assert_eq!(session.version, expected);
    }
}

#[tokio::test]
async fn failed_update_leaves_the_callers_version_bumped() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut session = Session::new("never-started", Order { a: 1 }, &*clock);
    let err = tracker.update(&ty, &mut session, &cancel).await.unwrap_err();
    assert!(matches!(err, TrackerError::NotFound(_)));
    assert_eq!(session.version, 2);
}

#[tokio::test]
async fn idle_session_expires_past_the_sliding_window() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    let key = SessionKey::from("k");

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();

    // Default policy: 30 s absolute, 10 s sliding.
    clock.advance(Duration::from_secs(11));
    let err = tracker.get(&ty, &key, &cancel).await.unwrap_err();
    assert!(matches!(err, TrackerError::NotFound(_)));
}

#[tokio::test]
async fn cancellation_short_circuits_every_operation() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let key = SessionKey::from("k");

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    let err = tracker.start(&ty, &mut session, &cancel).await.unwrap_err();
    assert!(matches!(err, StartError::Tracker(TrackerError::Cancelled)));
    assert_eq!(
        tracker.get(&ty, &key, &cancel).await.unwrap_err(),
        TrackerError::Cancelled
    );
    assert_eq!(
        tracker.finish(&ty, &key, &cancel).await.unwrap_err(),
        TrackerError::Cancelled
    );
}

// ── Locking scenarios ─────────────────────────────────────────────────────────

#[tokio::test]
async fn contended_lock_gives_up_after_the_wait_budget() {
    let tracker = system_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    let key = SessionKey::from("k");

    let _held = tracker.lock_once(&ty, &key).await.unwrap();

    let started = Instant::now();
    let err = tracker
        .lock_with(
            &ty,
            &key,
            Duration::from_secs(60),
            Duration::from_millis(400),
            Duration::from_millis(50),
            &cancel,
        )
        .await
        .unwrap_err();
    assert_eq!(err, TrackerError::LockNotAcquired(LockStatus::Conflicted));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(900), "gave up late: {elapsed:?}");
}

#[tokio::test]
async fn waiting_lock_wins_once_the_holder_releases() {
    let tracker = system_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    let key = SessionKey::from("k");

    let mut held = tracker.lock_once(&ty, &key).await.unwrap();
    let contender = tracker.clone();

    let task = tokio::spawn(async move {
        let ty = order_type();
        let key = SessionKey::from("k");
        let started = Instant::now();
        let lock = contender
            .lock_with(
                &ty,
                &key,
                Duration::from_secs(60),
                Duration::from_secs(2),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;
        (lock, started.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    held.release().await.unwrap();

    let (lock, elapsed) = task.await.unwrap();
    let lock = lock.unwrap();
    assert!(lock.is_acquired());
    assert!(elapsed >= Duration::from_millis(250), "won too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(900), "won too late: {elapsed:?}");
}

#[tokio::test]
async fn get_locked_releases_the_lock_when_the_get_fails() {
    let tracker = system_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    let key = SessionKey::from("missing");

    let err = tracker.get_locked(&ty, &key, &cancel).await.unwrap_err();
    assert!(matches!(err, TrackerError::NotFound(_)));

    // The lock must be free again immediately, not after a TTL.
    let lock = tracker.lock_once(&ty, &key).await.unwrap();
    assert!(lock.is_acquired());
}

#[tokio::test]
async fn get_locked_returns_session_and_live_lock() {
    let tracker = system_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();

    let mut session = Session::new("k", Order { a: 7 }, &SystemClock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();

    let mut locked = tracker
        .get_locked(&ty, &session.key, &cancel)
        .await
        .unwrap();
    assert_eq!(locked.session.payload, Order { a: 7 });
    assert!(locked.lock.is_acquired());

    // While held, a second owner conflicts.
    let err = tracker.lock_once(&ty, &session.key).await.unwrap_err();
    assert_eq!(err, TrackerError::LockNotAcquired(LockStatus::Conflicted));

    locked.lock.release().await.unwrap();
}

// ── Compartment exclusivity ──────────────────────────────────────────────────

#[tokio::test]
async fn at_most_one_compartment_holds_a_key() {
    let (tracker, clock) = manual_tracker();
    let ty = order_type();
    let cancel = CancellationToken::new();
    let key = SessionKey::from("k");

    let mut session = Session::new("k", Order { a: 1 }, &*clock);
    tracker.start(&ty, &mut session, &cancel).await.unwrap();

    // Active: get succeeds, get_evicted refuses.
    tracker.get(&ty, &key, &cancel).await.unwrap();
    assert_eq!(
        tracker.get_evicted(&ty, &key, &cancel).await.unwrap_err(),
        TrackerError::AlreadyRestored
    );

    // Evicted: the mirror image.
    tracker.finish(&ty, &key, &cancel).await.unwrap();
    tracker.get_evicted(&ty, &key, &cancel).await.unwrap();
    assert_eq!(
        tracker.get(&ty, &key, &cancel).await.unwrap_err(),
        TrackerError::AlreadyEvicted
    );
}
