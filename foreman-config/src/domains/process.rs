//! Worker process launch configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, Validatable};

/// How worker processes are started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Worker executable; the current executable when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,

    /// Arguments passed to the worker executable
    pub worker_args: Vec<String>,

    /// Time a new worker has to answer its first ping
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// Time a worker has to answer any later call
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: vec!["--worker".to_string()],
            ready_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl Validatable for ProcessConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.ready_timeout, "ready_timeout", self.domain_name())?;
        validate_duration(self.rpc_timeout, "rpc_timeout", self.domain_name())?;
        if let Some(program) = &self.worker_program {
            if program.as_os_str().is_empty() {
                return Err(self.validation_error("worker_program cannot be empty"));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "process"
    }
}
