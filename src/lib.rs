//! brickd - Brick Placement and Pending-Operation Engine
//!
//! A storage orchestrator for clusters of nodes running a replicated network
//! filesystem. It carves devices into bricks, assembles bricks into
//! replicated or erasure-coded volumes, and changes running volumes
//! (create, expand, delete, replace a brick, migrate off a node, evacuate a
//! device) through crash-consistent pending operations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      REST API  (/volumes, /queue, ...)               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │        Orchestrator          │          Task Runner (bounded)        │
//! ├──────────────────────────────┴───────────────────────────────────────┤
//! │   Pending Operation Engine   │   Brick Migration (replace / remove)  │
//! ├──────────────────────────────┼───────────────────────────────────────┤
//! │   Brick Allocator            │   Device Capacity Accountant          │
//! ├──────────────────────────────┴───────────────────────────────────────┤
//! │   Entity Store (transactions)   │   Executor (commands / in-memory)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, task runner and REST API
//! - [`operations`]: Pending operations and the engine driving them
//! - [`migration`]: Brick replacement, removal and evacuation
//! - [`allocation`]: Capacity accounting and brick placement
//! - [`store`]: Transactional entity store
//! - [`executor`]: Executor adapters
//! - [`domain`]: Durability and the executor port
//! - [`error`]: Error types and handling

pub mod allocation;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod executor;
pub mod migration;
pub mod operations;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, ExecutorKind, Orchestrator, OrchestratorConfig,
    OrchestratorStatus, RestRouter, TaskRunner, TaskStatus,
};

pub use allocation::{AllocationLimits, BrickAllocator, DeviceCapacity, PlacementEngine};

pub use domain::{Durability, Executor, ExecutorRef, GB};

pub use error::{Error, ErrorAction, Result};

pub use executor::{CmdExecutor, CmdExecutorConfig, LocalTransport, MockExecutor};

pub use operations::{run_operation, Operation, OperationState, RetryPolicy};

pub use store::Db;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
