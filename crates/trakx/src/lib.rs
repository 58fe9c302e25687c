//! trakx — a distributed session tracker.
//!
//! A typed, cached store for short-lived stateful objects shared across
//! horizontally-scaled service instances. Each session lives in one of two
//! compartments — active or evicted — behind an atomic state machine
//! evaluated server-side, with advisory distributed locks to serialize
//! cross-process mutations on the same key.
//!
//! ```no_run
//! use std::time::Duration;
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//! use trakx::{Session, SessionTracker, SessionType, SystemClock, TrackerSettings};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Checkout {
//!     cart_total: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut settings = TrackerSettings::default();
//!     settings.set_absolute_expiration("checkout", Duration::from_secs(300))?;
//!
//!     let tracker = SessionTracker::connect("redis://127.0.0.1/", settings).await?;
//!     let ty: SessionType<Checkout> = SessionType::json("checkout");
//!     let cancel = CancellationToken::new();
//!
//!     let mut session = Session::new("user-42", Checkout { cart_total: 0 }, &SystemClock);
//!     tracker.start(&ty, &mut session, &cancel).await?;
//!
//!     session.payload.cart_total = 3;
//!     tracker.update(&ty, &mut session, &cancel).await?;
//!     tracker.finish(&ty, &session.key, &cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod policy;
pub mod tracker;

pub use policy::{PolicyResolver, ResolvedPolicy};
pub use tracker::{LockedSession, SessionTracker, TrackerBuilder};

pub use trakx_core::clock::{Clock, ManualClock, SystemClock};
pub use trakx_core::codec::{BincodeCodec, JsonCodec, SessionCodec};
pub use trakx_core::error::{StartError, TrackerError};
pub use trakx_core::keys::KeyNamer;
pub use trakx_core::options::SessionEntryOptions;
pub use trakx_core::settings::{EffectivePolicy, TrackerSettings, TypePolicy};
pub use trakx_core::types::{LockStatus, Session, SessionKey, SessionType};

pub use trakx_engine::backend::{RedisBackend, ScriptBackend};
pub use trakx_engine::engine::CompartmentEngine;
pub use trakx_engine::memory::MemoryBackend;

pub use trakx_lock::coordinator::LockCoordinator;
pub use trakx_lock::handle::SessionLock;
pub use trakx_lock::memory::MemoryLockProvider;
pub use trakx_lock::provider::{AcquireOutcome, LockProvider};
pub use trakx_lock::quorum::QuorumLockProvider;
pub use trakx_lock::redis::RedisLockProvider;
