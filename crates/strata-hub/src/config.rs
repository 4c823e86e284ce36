//! Scheduler configuration
//!
//! Every field has a default, so a RON file only needs to name what it
//! changes:
//!
//! ```ron
//! (
//!     history_depth: 64,
//!     default_max_runtime_ms: 100,
//! )
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Scheduler`](crate::Scheduler)
///
/// # Example
///
/// ```
/// use strata_hub::SchedulerConfig;
///
/// let config = SchedulerConfig::from_ron_str("(history_depth: 8, pool_capacity: 4)").unwrap();
/// assert_eq!(config.history_depth, 8);
/// assert_eq!(config.pool_capacity, 4);
/// assert_eq!(config.default_failure_threshold, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Frames retained by the event accumulator
    pub history_depth: usize,
    /// Modules dispatched concurrently per wave, clamped to `[1, max_cores()]`
    pub max_parallel: usize,
    /// Snapshots the pool may hand out at once
    pub pool_capacity: usize,
    /// Snapshots allocated when the pool is created
    pub pool_prewarm: usize,
    /// Wall-clock budget of one module execution
    pub default_max_runtime_ms: u64,
    /// Consecutive failures that open a module's breaker
    pub default_failure_threshold: u32,
    /// Simulation time an open breaker waits before allowing a trial
    pub default_cooldown_ms: u64,
}

impl SchedulerConfig {
    /// Parse a configuration from RON text and validate it
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let config: SchedulerConfig =
            ron::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to RON text
    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.history_depth == 0 {
            return Err(Error::InvalidConfig("history_depth must be at least 1".into()));
        }
        if self.pool_capacity == 0 {
            return Err(Error::InvalidConfig("pool_capacity must be at least 1".into()));
        }
        if self.pool_prewarm > self.pool_capacity {
            return Err(Error::InvalidConfig(format!(
                "pool_prewarm ({}) exceeds pool_capacity ({})",
                self.pool_prewarm, self.pool_capacity
            )));
        }
        if self.default_max_runtime_ms == 0 {
            return Err(Error::InvalidConfig(
                "default_max_runtime_ms must be positive".into(),
            ));
        }
        if self.default_failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "default_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Set modules per wave; the value is clamped to `[1, max_cores()]`
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.clamp(1, max_cores());
        self
    }

    /// Modules per wave after clamping
    pub fn parallelism(&self) -> usize {
        self.max_parallel.clamp(1, max_cores())
    }

    pub fn default_max_runtime(&self) -> Duration {
        Duration::from_millis(self.default_max_runtime_ms)
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_cooldown_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            history_depth: 32,
            max_parallel: max_cores(),
            pool_capacity: 8,
            pool_prewarm: 0,
            default_max_runtime_ms: 250,
            default_failure_threshold: 3,
            default_cooldown_ms: 1000,
        }
    }
}

/// Get the maximum available cores on this system
///
/// This uses the `num_cpus` crate to detect the number of logical CPUs.
///
/// # Example
///
/// ```
/// use strata_hub::max_cores;
///
/// assert!(max_cores() >= 1);
/// ```
pub fn max_cores() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.history_depth, 32);
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.default_max_runtime(), Duration::from_millis(250));
        assert_eq!(config.default_cooldown(), Duration::from_secs(1));
        assert_eq!(config.parallelism(), max_cores());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_parallel_is_clamped() {
        let config = SchedulerConfig::default().with_max_parallel(0);
        assert_eq!(config.parallelism(), 1);

        let config = SchedulerConfig::default().with_max_parallel(usize::MAX);
        assert_eq!(config.parallelism(), max_cores());

        let config = SchedulerConfig {
            max_parallel: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.parallelism(), 1);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config = SchedulerConfig::from_ron_str("(default_cooldown_ms: 50)").unwrap();
        assert_eq!(config.default_cooldown(), Duration::from_millis(50));
        assert_eq!(config.history_depth, 32);
    }

    #[test]
    fn test_ron_roundtrip() {
        let config = SchedulerConfig {
            history_depth: 12,
            pool_prewarm: 2,
            ..SchedulerConfig::default()
        };
        let text = config.to_ron_string().unwrap();
        let back = SchedulerConfig::from_ron_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SchedulerConfig::from_ron_str("(history_depth: 0)").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = SchedulerConfig::from_ron_str("(pool_capacity: 2, pool_prewarm: 3)").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = SchedulerConfig::from_ron_str("(history_depth: \"deep\")").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
