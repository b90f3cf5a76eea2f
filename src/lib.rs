// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;

    pub use config::{CoordinatorConfig, CoordinatorConfigBuilder};
    pub use errors::{CoordinatorError, Result};
    pub use logging::init_tracing;
}

// Auto-execution coordinator
pub mod coord;

// Re-exports for convenience
pub use crate::core::config::CoordinatorConfig;
pub use crate::core::errors::{CoordinatorError, Result};
pub use coord::*;
