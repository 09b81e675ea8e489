//! Task manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, Validatable};

/// Queue polling cadence of the task manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Poll interval while the queue is empty
    #[serde(with = "humantime_serde")]
    pub idle_poll_interval: Duration,

    /// Poll interval while work is pending
    #[serde(with = "humantime_serde")]
    pub busy_poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_secs(1),
            busy_poll_interval: Duration::from_millis(100),
        }
    }
}

impl Validatable for ManagerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.idle_poll_interval, "idle_poll_interval", self.domain_name())?;
        validate_duration(self.busy_poll_interval, "busy_poll_interval", self.domain_name())?;

        if self.busy_poll_interval > self.idle_poll_interval {
            return Err(self.validation_error(
                "busy_poll_interval cannot be longer than idle_poll_interval",
            ));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "manager"
    }
}
