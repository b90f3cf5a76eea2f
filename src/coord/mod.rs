//! Per-entity auto-execution
//!
//! The coordinator walks each entity through its permitted workflow phases,
//! dispatching one agent per phase and publishing every transition.

pub mod types;
pub mod phase;
pub mod events;
pub mod hooks;
pub mod coordinator;
pub mod driver;

pub use types::*;
pub use phase::*;
pub use events::*;
pub use hooks::*;
pub use coordinator::*;
pub use driver::*;
