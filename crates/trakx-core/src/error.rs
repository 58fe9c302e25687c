use std::fmt;
use thiserror::Error;

use crate::types::{LockStatus, Session, SessionKey};

/// The closed set of conditions a caller can observe from any tracker
/// operation. Transport and codec causes are carried as strings so the
/// taxonomy stays stable across backend library upgrades.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    // ── State machine ────────────────────────────────────────────────────────
    #[error("session not found: {0}")]
    NotFound(SessionKey),

    #[error("session already evicted")]
    AlreadyEvicted,

    #[error("session already restored")]
    AlreadyRestored,

    // ── Locking ──────────────────────────────────────────────────────────────
    #[error("lock not acquired: {0}")]
    LockNotAcquired(LockStatus),

    // ── Codec / backend ──────────────────────────────────────────────────────
    #[error("codec error: {0}")]
    Codec(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("unexpected backend result: {0}")]
    UnexpectedBackendResult(String),

    // ── Control ──────────────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

/// Outcome of the add family. Splitting this off the shared taxonomy keeps
/// the decoded loser payload available without dragging the payload type
/// parameter onto every other operation.
#[derive(Debug, Error)]
pub enum StartError<P: fmt::Debug> {
    /// An active entry already holds the key; carries the decoded winner.
    #[error("session already started")]
    AlreadyStarted(Session<P>),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl<P: fmt::Debug> StartError<P> {
    /// The shared-taxonomy view, dropping the carried session if any.
    pub fn into_tracker_error(self) -> Option<TrackerError> {
        match self {
            StartError::AlreadyStarted(_) => None,
            StartError::Tracker(e) => Some(e),
        }
    }
}
