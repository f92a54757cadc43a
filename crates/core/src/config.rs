//! Interval and backoff parameters. Read-only to the reconcilers; the host swaps
//! in a fresh value between invocations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Poll interval once Reconciled, ResourcesReady and Ready are all True.
    #[serde(with = "secs")]
    pub steady_interval: Duration,
    /// Requeue after a failure on a condition that was absent or True.
    #[serde(with = "secs")]
    pub fresh_failure_interval: Duration,
    /// Requeue after a failure on a condition that was already False.
    #[serde(with = "secs")]
    pub repeat_failure_interval: Duration,
    /// Poll interval while the workload is converging.
    #[serde(with = "secs")]
    pub not_ready_interval: Duration,
    /// Requeue after an optimistic-concurrency conflict on a status write.
    #[serde(with = "secs")]
    pub conflict_interval: Duration,
    /// Growth applied to an identical repeated failure (100 = doubling).
    pub interval_increase_pct: u32,
    #[serde(with = "secs")]
    pub min_interval: Duration,
    #[serde(with = "secs")]
    pub max_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            steady_interval: Duration::from_secs(15),
            fresh_failure_interval: Duration::from_secs(1),
            repeat_failure_interval: Duration::from_secs(5),
            not_ready_interval: Duration::from_secs(1),
            conflict_interval: Duration::from_secs(1),
            interval_increase_pct: 100,
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("minInterval ({min:?}) exceeds maxInterval ({max:?})")]
    Bounds { min: Duration, max: Duration },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval > self.max_interval {
            return Err(ConfigError::Bounds { min: self.min_interval, max: self.max_interval });
        }
        if self.steady_interval.is_zero() { return Err(ConfigError::Zero("steadyInterval")); }
        if self.min_interval.is_zero() { return Err(ConfigError::Zero("minInterval")); }
        Ok(())
    }

    /// Next retry delay for a repeated failure.
    ///
    /// `previous` is the delay observed since the identical failure was last
    /// recorded; `None` means the failure is new (or changed) and restarts at
    /// `min_interval`. Otherwise the delay grows by `interval_increase_pct`
    /// and is capped at `max_interval`.
    pub fn next_backoff(&self, previous: Option<Duration>) -> Duration {
        let Some(prev) = previous else { return self.min_interval };
        let base = prev.max(self.min_interval).as_millis();
        let grown = base.saturating_mul(100 + self.interval_increase_pct as u128) / 100;
        Duration::from_millis(grown.min(u64::MAX as u128) as u64).min(self.max_interval)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_intervals() {
        let cfg = ReconcileConfig::default();
        assert_eq!(cfg.steady_interval, Duration::from_secs(15));
        assert_eq!(cfg.fresh_failure_interval, Duration::from_secs(1));
        assert_eq!(cfg.repeat_failure_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_interval, Duration::from_secs(21_600));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = ReconcileConfig::default();
        assert_eq!(cfg.next_backoff(None), Duration::from_secs(1));
        let mut cur = cfg.next_backoff(None);
        let mut seen = vec![cur];
        for _ in 0..20 {
            cur = cfg.next_backoff(Some(cur));
            seen.push(cur);
        }
        assert_eq!(&seen[..5], &[1, 2, 4, 8, 16].map(Duration::from_secs));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(21_600));
    }

    #[test]
    fn backoff_floors_short_elapsed_at_min() {
        let cfg = ReconcileConfig::default();
        assert_eq!(cfg.next_backoff(Some(Duration::ZERO)), Duration::from_secs(2));
    }

    #[test]
    fn increase_percentage_is_honoured() {
        let cfg = ReconcileConfig { interval_increase_pct: 50, ..Default::default() };
        assert_eq!(cfg.next_backoff(Some(Duration::from_secs(10))), Duration::from_secs(15));
    }

    #[test]
    fn partial_yaml_like_json_fills_defaults() {
        let cfg: ReconcileConfig = serde_json::from_value(serde_json::json!({"steadyInterval": 30})).unwrap();
        assert_eq!(cfg.steady_interval, Duration::from_secs(30));
        assert_eq!(cfg.conflict_interval, Duration::from_secs(1));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let cfg = ReconcileConfig { min_interval: Duration::from_secs(10), max_interval: Duration::from_secs(5), ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Bounds { .. })));
    }
}
