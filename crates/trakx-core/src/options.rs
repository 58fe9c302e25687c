use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::TrackerError;

/// Expiration policy for one compartment entry.
///
/// An absolute bound may be given as a point in time or relative to "now";
/// if both are present the point in time wins. Sliding expiration re-arms the
/// backend TTL on every successful read, refresh, or update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionEntryOptions {
    absolute_expiration: Option<DateTime<Utc>>,
    absolute_expiration_relative_to_now: Option<Duration>,
    sliding_expiration: Option<Duration>,
}

impl SessionEntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a fixed expiration instant. Must lie strictly in the future.
    pub fn set_absolute_expiration(
        &mut self,
        at: DateTime<Utc>,
        clock: &dyn Clock,
    ) -> Result<&mut Self, TrackerError> {
        if at <= clock.now() {
            return Err(TrackerError::InvalidOptions(format!(
                "absolute expiration must lie in the future (got {at})"
            )));
        }
        self.absolute_expiration = Some(at);
        Ok(self)
    }

    /// Sets an absolute bound measured from the moment the entry is written.
    pub fn set_absolute_expiration_relative_to_now(
        &mut self,
        after: Duration,
    ) -> Result<&mut Self, TrackerError> {
        if after.is_zero() {
            return Err(TrackerError::InvalidOptions(
                "relative absolute expiration must be positive".into(),
            ));
        }
        self.absolute_expiration_relative_to_now = Some(after);
        Ok(self)
    }

    pub fn set_sliding_expiration(&mut self, window: Duration) -> Result<&mut Self, TrackerError> {
        if window.is_zero() {
            return Err(TrackerError::InvalidOptions(
                "sliding expiration must be positive".into(),
            ));
        }
        self.sliding_expiration = Some(window);
        Ok(self)
    }

    pub fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.absolute_expiration
    }

    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.sliding_expiration
    }

    /// The absolute bound this entry ends up with when written at `reference`.
    pub fn resolve_absolute(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.absolute_expiration.or_else(|| {
            self.absolute_expiration_relative_to_now.map(|d| {
                reference + ChronoDuration::from_std(d).expect("duration fits chrono range")
            })
        })
    }

    /// Effective backend TTL in whole seconds for an entry created at
    /// `creation`: `min(absolute − creation, sliding)` when both bounds are
    /// set, whichever is present otherwise, `None` when the entry never
    /// expires.
    pub fn expiration_seconds(&self, creation: DateTime<Utc>) -> Option<i64> {
        let absolute = self
            .resolve_absolute(creation)
            .map(|at| (at - creation).num_seconds());
        let sliding = self.sliding_expiration.map(|d| d.as_secs() as i64);
        match (absolute, sliding) {
            (Some(a), Some(s)) => Some(a.min(s)),
            (Some(a), None) => Some(a),
            (None, Some(s)) => Some(s),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> ManualClock {
        ManualClock::starting_at(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn absolute_at_now_is_rejected() {
        let clock = clock();
        let mut opts = SessionEntryOptions::new();
        let err = opts
            .set_absolute_expiration(clock.now(), &clock)
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidOptions(_)));
    }

    #[test]
    fn non_positive_durations_are_rejected() {
        let mut opts = SessionEntryOptions::new();
        assert!(opts.set_sliding_expiration(Duration::ZERO).is_err());
        assert!(opts
            .set_absolute_expiration_relative_to_now(Duration::ZERO)
            .is_err());
    }

    #[test]
    fn sliding_alone_is_the_effective_ttl() {
        let clock = clock();
        let mut opts = SessionEntryOptions::new();
        opts.set_sliding_expiration(Duration::from_secs(10)).unwrap();
        assert_eq!(opts.expiration_seconds(clock.now()), Some(10));
    }

    #[test]
    fn effective_ttl_is_min_of_absolute_and_sliding() {
        let clock = clock();
        let mut opts = SessionEntryOptions::new();
        opts.set_absolute_expiration_relative_to_now(Duration::from_secs(30))
            .unwrap();
        opts.set_sliding_expiration(Duration::from_secs(10)).unwrap();
        assert_eq!(opts.expiration_seconds(clock.now()), Some(10));

        let mut opts = SessionEntryOptions::new();
        opts.set_absolute_expiration_relative_to_now(Duration::from_secs(5))
            .unwrap();
        opts.set_sliding_expiration(Duration::from_secs(10)).unwrap();
        assert_eq!(opts.expiration_seconds(clock.now()), Some(5));
    }

    #[test]
    fn fixed_instant_wins_over_relative() {
        let clock = clock();
        let mut opts = SessionEntryOptions::new();
        let at = clock.now() + ChronoDuration::seconds(60);
        opts.set_absolute_expiration(at, &clock).unwrap();
        opts.set_absolute_expiration_relative_to_now(Duration::from_secs(5))
            .unwrap();
        assert_eq!(opts.resolve_absolute(clock.now()), Some(at));
        assert_eq!(opts.expiration_seconds(clock.now()), Some(60));
    }

    #[test]
    fn no_bounds_means_no_expiry() {
        let clock = clock();
        let opts = SessionEntryOptions::new();
        assert_eq!(opts.expiration_seconds(clock.now()), None);
    }
}
