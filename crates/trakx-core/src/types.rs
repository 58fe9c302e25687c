use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::codec::{BincodeCodec, JsonCodec, SessionCodec};

// ── SessionKey ───────────────────────────────────────────────────────────────

/// Caller-supplied session identifier. Opaque and stable for the whole
/// lifetime of the session; the tracker never interprets its contents.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.0)
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// The tracked entity: a user payload wrapped with the bookkeeping fields the
/// tracker maintains.
///
/// `version` starts at 1 and is bumped by the facade on every update attempt;
/// the stored copy only ever moves forward on success. `started_at` is fixed
/// at construction from the injected clock. The two provider keys are filled
/// in by the engine on the first successful add and are stable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session<P> {
    pub key: SessionKey,
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub active_provider_key: Option<String>,
    pub evicted_provider_key: Option<String>,
    pub payload: P,
}

impl<P> Session<P> {
    pub fn new(key: impl Into<SessionKey>, payload: P, clock: &dyn Clock) -> Self {
        Self {
            key: key.into(),
            version: 1,
            started_at: clock.now(),
            active_provider_key: None,
            evicted_provider_key: None,
            payload,
        }
    }
}

// ── SessionType ──────────────────────────────────────────────────────────────

/// Run-time description of a session type: the name that scopes backend keys
/// and per-type configuration, paired with the codec for its payload.
///
/// The name is folded to ASCII lowercase so that differently-cased callers
/// land on the same keys.
pub struct SessionType<P> {
    name: String,
    codec: Arc<dyn SessionCodec<Session<P>>>,
}

impl<P> SessionType<P> {
    pub fn with_codec(name: impl Into<String>, codec: Arc<dyn SessionCodec<Session<P>>>) -> Self {
        let name: String = name.into();
        Self {
            name: name.to_ascii_lowercase(),
            codec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &dyn SessionCodec<Session<P>> {
        &*self.codec
    }
}

impl<P> SessionType<P>
where
    P: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    /// A session type whose payload travels as JSON.
    pub fn json(name: impl Into<String>) -> Self {
        Self::with_codec(name, Arc::new(JsonCodec))
    }

    /// A session type whose payload travels as bincode.
    pub fn bincode(name: impl Into<String>) -> Self {
        Self::with_codec(name, Arc::new(BincodeCodec))
    }
}

impl<P> Clone for SessionType<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<P> fmt::Debug for SessionType<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionType({})", self.name)
    }
}

// ── LockStatus ───────────────────────────────────────────────────────────────

/// The state vocabulary every lock provider must surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Released, or never acquired.
    Unlocked,
    /// Held by the caller.
    Acquired,
    /// Distributed consensus failed to reach a majority.
    NoQuorum,
    /// Some other owner holds the resource.
    Conflicted,
    /// The TTL elapsed while held.
    Expired,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockStatus::Unlocked => "unlocked",
            LockStatus::Acquired => "acquired",
            LockStatus::NoQuorum => "no quorum",
            LockStatus::Conflicted => "conflicted",
            LockStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
