//! trakx-engine
//!
//! The two-compartment state machine over a script-evaluating backend.
//! Every public operation is a single atomic server-side script; the five
//! script bodies and their digests live in [`scripts`], the Redis and
//! in-memory backends in [`backend`] and [`memory`].

pub mod backend;
pub mod engine;
pub mod memory;
pub mod scripts;

pub use backend::{RedisBackend, ScriptBackend};
pub use engine::CompartmentEngine;
pub use memory::MemoryBackend;
pub use scripts::{LuaScript, ScriptName, ScriptSet, SCRIPTS};
