use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::errors::{CoordinatorError, Result};

/// Default global cap on tracked entities
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// Default bound on `retry_from` attempts per run
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default per-phase timeout (10 minutes)
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_millis(600_000);

/// Coordinator tuning parameters. Supplied by the embedding process, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum number of table entries across all entities
    pub max_concurrent: usize,
    /// Maximum retry attempts since the last successful start
    pub max_retries: u32,
    /// Time a dispatched phase may run before it is failed
    pub phase_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CoordinatorError::configuration(
                "max_concurrent must be greater than 0",
            ));
        }
        if self.phase_timeout.is_zero() {
            return Err(CoordinatorError::configuration(
                "phase_timeout must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Short timeouts for local development and tests
    pub fn development() -> Self {
        Self {
            phase_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }
}

/// Builder for CoordinatorConfig
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn phase_timeout(mut self, timeout: Duration) -> Self {
        self.config.phase_timeout = timeout;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
