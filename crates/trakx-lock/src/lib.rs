//! trakx-lock
//!
//! Advisory distributed locks on session keys: a uniform provider contract
//! with single-node Redis, Redlock-style quorum, and in-process variants,
//! plus the coordinator that owns wait/retry/cancellation policy.

pub mod coordinator;
pub mod handle;
pub mod memory;
pub mod provider;
pub mod quorum;
pub mod redis;

pub use coordinator::LockCoordinator;
pub use handle::SessionLock;
pub use memory::MemoryLockProvider;
pub use provider::{AcquireOutcome, LockProvider};
pub use quorum::QuorumLockProvider;
pub use self::redis::RedisLockProvider;
