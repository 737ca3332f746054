//! Executor adapters
//!
//! Concrete implementations of the [`crate::domain::Executor`] port: a
//! command-building executor over a pluggable transport, and an in-memory
//! executor for tests and standalone mode.

pub mod cmdexec;
pub mod mock;

pub use cmdexec::*;
pub use mock::*;
