//! Configuration loading and environment variable handling

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::pool::PoolConfig;
use crate::domains::process::ProcessConfig;
use crate::domains::ForemanConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "FOREMAN".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ForemanConfig> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        let mut config: ForemanConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ForemanConfig> {
        let mut config = ForemanConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ForemanConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut ForemanConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_process_overrides(&mut config.process)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_pool_overrides(&self, config: &mut PoolConfig) -> ConfigResult<()> {
        if let Some(min_size) = self.parse_env_var("POOL_MIN_SIZE")? {
            config.min_size = min_size;
        }

        if let Some(max_size) = self.parse_env_var("POOL_MAX_SIZE")? {
            config.max_size = max_size;
        }

        if let Some(seconds) = self.parse_env_var::<u64>("POOL_TTL_SECONDS")? {
            config.ttl = Duration::from_secs(seconds);
        }

        if let Some(max_jobs) = self.parse_env_var("POOL_MAX_JOBS_PER_PROCESS")? {
            config.max_jobs_per_process = max_jobs;
        }

        Ok(())
    }

    fn apply_process_overrides(&self, config: &mut ProcessConfig) -> ConfigResult<()> {
        if let Ok(program) = self.get_env_var("WORKER_PROGRAM") {
            config.worker_program = Some(PathBuf::from(program));
        }

        if let Some(seconds) = self.parse_env_var::<u64>("RPC_TIMEOUT_SECONDS")? {
            config.rpc_timeout = Duration::from_secs(seconds);
        }

        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}_{}: {}", self.prefix, name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
