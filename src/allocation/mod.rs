//! Allocation Module
//!
//! Provides device capacity accounting, brick placement across nodes and
//! zones, and transactional brick reservation.

pub mod allocator;
pub mod capacity;
pub mod placement;

pub use allocator::*;
pub use capacity::*;
pub use placement::*;
