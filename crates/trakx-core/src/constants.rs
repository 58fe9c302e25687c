//! Defaults and wire-level sentinels shared by every trakx crate.

// ── Key layout ───────────────────────────────────────────────────────────────

/// Prefix for every backend key the tracker owns.
pub const DEFAULT_KEY_PREFIX: &str = "session-tracker";

/// Segment inserted between the key prefix and the type name for lock keys.
pub const DEFAULT_LOCK_PREFIX: &str = "lock";

/// Segment marking the evicted compartment in backend keys.
pub const EVICTED_SEGMENT: &str = "evicted";

// ── Expiration defaults (seconds) ────────────────────────────────────────────

pub const DEFAULT_ABSOLUTE_EXPIRATION_SECS: u64 = 30;
pub const DEFAULT_SLIDING_EXPIRATION_SECS: u64 = 10;
pub const DEFAULT_EVICTED_ABSOLUTE_EXPIRATION_SECS: u64 = 30;
pub const DEFAULT_EVICTED_SLIDING_EXPIRATION_SECS: u64 = 10;

// ── Lock defaults (seconds) ──────────────────────────────────────────────────

pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 10;
pub const DEFAULT_LOCK_RETRY_SECS: u64 = 3;

// ── Script dispatch ──────────────────────────────────────────────────────────

/// How many times a hash-based eval is retried after a NOSCRIPT-class error
/// before the call fails. Only meaningful with proxy optimisation enabled.
pub const DEFAULT_SCRIPT_RETRY_LIMIT: u32 = 1;

// ── Script protocol sentinels ────────────────────────────────────────────────

/// Numeric sentinel meaning "no value" in absexp/sldexp/ttl script arguments
/// and in the stored hash fields.
pub const NO_EXPIRY: i64 = -1;

/// Script return marking "the other compartment already holds this key".
pub const OTHER_COMPARTMENT_SENTINEL: &str = "-1";

/// Script return marking success without payload.
pub const UNIT_SENTINEL: &str = "1";
