//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, Validatable};

/// Sizing and lifecycle settings of a worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Processes kept alive even when idle; 0 is treated as 1
    pub min_size: usize,

    /// Upper bound on live plus spawning processes
    pub max_size: usize,

    /// Idle time after which a worker process is terminated
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Concurrent async tasks one process may hold
    pub max_jobs_per_process: usize,

    /// Launch attempts per spawn before giving up
    pub spawn_attempts: usize,

    /// Grace period given to processes on pool shutdown
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            ttl: Duration::from_secs(60),
            max_jobs_per_process: 10,
            spawn_attempts: 3,
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Copy of this config with `min_size` raised to at least one
    pub fn normalized(&self) -> Self {
        Self {
            min_size: self.min_size.max(1),
            ..self.clone()
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_size, "max_size", self.domain_name())?;
        validate_positive(
            self.max_jobs_per_process,
            "max_jobs_per_process",
            self.domain_name(),
        )?;
        validate_positive(self.spawn_attempts, "spawn_attempts", self.domain_name())?;
        validate_duration(self.ttl, "ttl", self.domain_name())?;

        if self.min_size.max(1) > self.max_size {
            return Err(self.validation_error(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 1);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.max_jobs_per_process, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_min_size_normalized() {
        let config = PoolConfig {
            min_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.normalized().min_size, 1);
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = PoolConfig {
            min_size: 5,
            max_size: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_size (5) cannot exceed max_size (2)"));
    }

    #[test]
    fn test_humantime_durations() {
        let config: PoolConfig = serde_yaml::from_str("ttl: 1m 30s\nterminate_timeout: 250ms").unwrap();
        assert_eq!(config.ttl, Duration::from_secs(90));
        assert_eq!(config.terminate_timeout, Duration::from_millis(250));
        assert_eq!(config.max_size, 4);
    }
}
