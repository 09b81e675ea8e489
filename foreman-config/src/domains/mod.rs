//! Domain-specific configuration modules

pub mod logging;
pub mod manager;
pub mod pool;
pub mod process;
pub mod service;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Foreman configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForemanConfig {
    /// Worker pool sizing
    pub pool: pool::PoolConfig,

    /// Task manager polling
    pub manager: manager::ManagerConfig,

    /// Service supervision
    pub service: service::ServiceConfig,

    /// Worker process launching
    pub process: process::ProcessConfig,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

impl ForemanConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.manager.validate()?;
        self.service.validate()?;
        self.process.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = ForemanConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
