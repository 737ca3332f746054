//! Domain layer - Core value types and port definitions
//!
//! This module defines durability semantics and the executor port that
//! adapters implement, following hexagonal architecture principles.

pub mod durability;
pub mod ports;

pub use durability::*;
pub use ports::*;
