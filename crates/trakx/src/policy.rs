use std::time::Duration;

use trakx_core::error::TrackerError;
use trakx_core::options::SessionEntryOptions;
use trakx_core::settings::TrackerSettings;

/// Fully-resolved timing for one session type: the entry options each
/// compartment gets and the lock cadence.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub active: SessionEntryOptions,
    pub evicted: SessionEntryOptions,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub lock_retry: Duration,
}

/// Turns the per-type settings tables into per-call entry options.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    settings: TrackerSettings,
}

impl PolicyResolver {
    pub fn new(settings: TrackerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn resolve(&self, type_name: &str) -> Result<ResolvedPolicy, TrackerError> {
        let effective = self.settings.effective(type_name);

        let mut active = SessionEntryOptions::new();
        active.set_absolute_expiration_relative_to_now(effective.absolute_expiration)?;
        active.set_sliding_expiration(effective.sliding_expiration)?;

        let mut evicted = SessionEntryOptions::new();
        evicted.set_absolute_expiration_relative_to_now(effective.evicted_absolute_expiration)?;
        evicted.set_sliding_expiration(effective.evicted_sliding_expiration)?;

        Ok(ResolvedPolicy {
            active,
            evicted,
            lock_ttl: effective.lock_ttl,
            lock_wait: effective.lock_wait,
            lock_retry: effective.lock_retry,
        })
    }
}
