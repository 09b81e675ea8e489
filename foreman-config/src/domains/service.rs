//! Service supervision configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, Validatable};

/// What happens to a service after its process stops
///
/// The policy only applies once a service has started successfully; the
/// first start is always attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Respawn whenever the process exits
    #[default]
    Always,
    /// Leave stopped and report the failure
    Never,
    /// Leave stopped without surfacing a failure
    NeverSilent,
}

impl RestartPolicy {
    pub fn restarts(&self) -> bool {
        matches!(self, RestartPolicy::Always)
    }
}

/// Per-service supervision options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Time a service gets to exit after a graceful termination request
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,

    /// Time after which the kill signal is used instead of the terminate signal
    #[serde(with = "humantime_serde")]
    pub terminate_timeout_hard: Duration,

    pub restart_policy: RestartPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            terminate_timeout: Duration::from_secs(5),
            terminate_timeout_hard: Duration::from_secs(10),
            restart_policy: RestartPolicy::Always,
        }
    }
}

impl Validatable for ServiceOptions {
    fn validate(&self) -> ConfigResult<()> {
        if self.terminate_timeout_hard < self.terminate_timeout {
            return Err(self.validation_error(
                "terminate_timeout_hard cannot be shorter than terminate_timeout",
            ));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "service.defaults"
    }
}

/// Service manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Supervision tick interval
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Options applied to services registered without explicit options
    pub defaults: ServiceOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            defaults: ServiceOptions::default(),
        }
    }
}

impl Validatable for ServiceConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.check_interval, "check_interval", self.domain_name())?;
        self.defaults.validate()
    }

    fn domain_name(&self) -> &'static str {
        "service"
    }
}
