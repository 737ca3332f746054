//! Control Plane Module
//!
//! The orchestrator, the task runner that executes pending operations in
//! the background, and the API serving both.

pub mod orchestrator;
pub mod tasks;
pub mod api;

pub use orchestrator::*;
pub use tasks::*;
pub use api::*;
