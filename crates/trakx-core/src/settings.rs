use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{
    DEFAULT_ABSOLUTE_EXPIRATION_SECS, DEFAULT_EVICTED_ABSOLUTE_EXPIRATION_SECS,
    DEFAULT_EVICTED_SLIDING_EXPIRATION_SECS, DEFAULT_KEY_PREFIX, DEFAULT_LOCK_PREFIX,
    DEFAULT_LOCK_RETRY_SECS, DEFAULT_LOCK_TTL_SECS, DEFAULT_LOCK_WAIT_SECS,
    DEFAULT_SCRIPT_RETRY_LIMIT, DEFAULT_SLIDING_EXPIRATION_SECS,
};
use crate::error::TrackerError;

/// Partial per-type override. Unset fields fall back to the defaults table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypePolicy {
    pub absolute_expiration: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    pub evicted_absolute_expiration: Option<Duration>,
    pub evicted_sliding_expiration: Option<Duration>,
    pub lock_ttl: Option<Duration>,
    pub lock_wait: Option<Duration>,
    pub lock_retry: Option<Duration>,
}

/// Fully-resolved policy for one session type.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub absolute_expiration: Duration,
    pub sliding_expiration: Duration,
    pub evicted_absolute_expiration: Duration,
    pub evicted_sliding_expiration: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_retry: Duration,
}

/// Tracker-wide configuration: key layout, script dispatch behaviour, the
/// expiration defaults, and the per-type override table.
///
/// All durations are validated at set time; a zero duration never reaches the
/// engine. Per-type setters write the per-type entry and nothing else.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub key_prefix: String,
    pub lock_prefix: String,
    /// Send EVALSHA first and recover from NOSCRIPT, instead of sending the
    /// full script body on every call. Worth enabling behind proxies that
    /// penalise repeated script bodies.
    pub use_proxy_optimisation: bool,
    /// How many NOSCRIPT recoveries to attempt per call before failing.
    pub proxy_retry_limit: u32,
    defaults: EffectivePolicy,
    per_type: HashMap<String, TypePolicy>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.into(),
            lock_prefix: DEFAULT_LOCK_PREFIX.into(),
            use_proxy_optimisation: false,
            proxy_retry_limit: DEFAULT_SCRIPT_RETRY_LIMIT,
            defaults: EffectivePolicy {
                absolute_expiration: Duration::from_secs(DEFAULT_ABSOLUTE_EXPIRATION_SECS),
                sliding_expiration: Duration::from_secs(DEFAULT_SLIDING_EXPIRATION_SECS),
                evicted_absolute_expiration: Duration::from_secs(
                    DEFAULT_EVICTED_ABSOLUTE_EXPIRATION_SECS,
                ),
                evicted_sliding_expiration: Duration::from_secs(
                    DEFAULT_EVICTED_SLIDING_EXPIRATION_SECS,
                ),
                lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
                lock_wait: Duration::from_secs(DEFAULT_LOCK_WAIT_SECS),
                lock_retry: Duration::from_secs(DEFAULT_LOCK_RETRY_SECS),
            },
            per_type: HashMap::new(),
        }
    }
}

fn positive(d: Duration, what: &str) -> Result<Duration, TrackerError> {
    if d.is_zero() {
        return Err(TrackerError::InvalidOptions(format!(
            "{what} must be positive"
        )));
    }
    Ok(d)
}

impl TrackerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Defaults ─────────────────────────────────────────────────────────────

    pub fn set_default_absolute_expiration(&mut self, d: Duration) -> Result<(), TrackerError> {
        self.defaults.absolute_expiration = positive(d, "default absolute expiration")?;
        Ok(())
    }

    pub fn set_default_sliding_expiration(&mut self, d: Duration) -> Result<(), TrackerError> {
        self.defaults.sliding_expiration = positive(d, "default sliding expiration")?;
        Ok(())
    }

    pub fn set_default_evicted_absolute_expiration(
        &mut self,
        d: Duration,
    ) -> Result<(), TrackerError> {
        self.defaults.evicted_absolute_expiration =
            positive(d, "default evicted absolute expiration")?;
        Ok(())
    }

    pub fn set_default_evicted_sliding_expiration(
        &mut self,
        d: Duration,
    ) -> Result<(), TrackerError> {
        self.defaults.evicted_sliding_expiration =
            positive(d, "default evicted sliding expiration")?;
        Ok(())
    }

    pub fn set_default_lock_ttl(&mut self, d: Duration) -> Result<(), TrackerError> {
        self.defaults.lock_ttl = positive(d, "default lock ttl")?;
        Ok(())
    }

    pub fn set_default_lock_wait(&mut self, d: Duration) -> Result<(), TrackerError> {
        self.defaults.lock_wait = positive(d, "default lock wait")?;
        Ok(())
    }

    pub fn set_default_lock_retry(&mut self, d: Duration) -> Result<(), TrackerError> {
        self.defaults.lock_retry = positive(d, "default lock retry")?;
        Ok(())
    }

    // ── Per-type overrides ───────────────────────────────────────────────────
    //
    // These touch only the named type's entry; the defaults table is never
    // written through a per-type setter.

    pub fn set_type_policy(&mut self, type_name: &str, policy: TypePolicy) {
        self.per_type
            .insert(type_name.to_ascii_lowercase(), policy);
    }

    pub fn set_absolute_expiration(
        &mut self,
        type_name: &str,
        d: Duration,
    ) -> Result<(), TrackerError> {
        let d = positive(d, "absolute expiration")?;
        self.entry(type_name).absolute_expiration = Some(d);
        Ok(())
    }

    pub fn set_sliding_expiration(
        &mut self,
        type_name: &str,
        d: Duration,
    ) -> Result<(), TrackerError> {
        let d = positive(d, "sliding expiration")?;
        self.entry(type_name).sliding_expiration = Some(d);
        Ok(())
    }

    pub fn set_evicted_absolute_expiration(
        &mut self,
        type_name: &str,
        d: Duration,
    ) -> Result<(), TrackerError> {
        let d = positive(d, "evicted absolute expiration")?;
        self.entry(type_name).evicted_absolute_expiration = Some(d);
        Ok(())
    }

    pub fn set_evicted_sliding_expiration(
        &mut self,
        type_name: &str,
        d: Duration,
    ) -> Result<(), TrackerError> {
        let d = positive(d, "evicted sliding expiration")?;
        self.entry(type_name).evicted_sliding_expiration = Some(d);
        Ok(())
    }

    pub fn set_lock_ttl(&mut self, type_name: &str, d: Duration) -> Result<(), TrackerError> {
        let d = positive(d, "lock ttl")?;
        self.entry(type_name).lock_ttl = Some(d);
        Ok(())
    }

    pub fn set_lock_wait(&mut self, type_name: &str, d: Duration) -> Result<(), TrackerError> {
        let d = positive(d, "lock wait")?;
        self.entry(type_name).lock_wait = Some(d);
        Ok(())
    }

    pub fn set_lock_retry(&mut self, type_name: &str, d: Duration) -> Result<(), TrackerError> {
        let d = positive(d, "lock retry")?;
        self.entry(type_name).lock_retry = Some(d);
        Ok(())
    }

    fn entry(&mut self, type_name: &str) -> &mut TypePolicy {
        self.per_type
            .entry(type_name.to_ascii_lowercase())
            .or_default()
    }

    // ── Resolution ───────────────────────────────────────────────────────────

    /// Per-type override > default, field by field.
    pub fn effective(&self, type_name: &str) -> EffectivePolicy {
        let d = &self.defaults;
        match self.per_type.get(&type_name.to_ascii_lowercase()) {
            None => d.clone(),
            Some(t) => EffectivePolicy {
                absolute_expiration: t.absolute_expiration.unwrap_or(d.absolute_expiration),
                sliding_expiration: t.sliding_expiration.unwrap_or(d.sliding_expiration),
                evicted_absolute_expiration: t
                    .evicted_absolute_expiration
                    .unwrap_or(d.evicted_absolute_expiration),
                evicted_sliding_expiration: t
                    .evicted_sliding_expiration
                    .unwrap_or(d.evicted_sliding_expiration),
                lock_ttl: t.lock_ttl.unwrap_or(d.lock_ttl),
                lock_wait: t.lock_wait.unwrap_or(d.lock_wait),
                lock_retry: t.lock_retry.unwrap_or(d.lock_retry),
            },
        }
    }
}
