//! Device Capacity Accounting
//!
//! Every reservation and reclamation of device space goes through
//! [`DeviceCapacity`]. Sizes are in KiB.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Thin pool metadata is 0.5% of the thin pool size, in parts per thousand
pub const POOL_METADATA_PER_MILLE: u64 = 5;

/// Upper bound for a volume's snapshot factor unless configured otherwise
pub const DEFAULT_MAX_SNAPSHOT_FACTOR: f64 = 100.0;

// =============================================================================
// Device Capacity
// =============================================================================

/// Capacity of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapacity {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

impl DeviceCapacity {
    /// A fresh, empty device
    pub fn new(total: u64) -> Self {
        Self {
            total,
            free: total,
            used: 0,
        }
    }

    pub fn can_allocate(&self, size: u64) -> bool {
        size <= self.free
    }

    /// Reserve `size` KiB; fails without mutating when it does not fit
    pub fn allocate(&mut self, size: u64) -> Result<()> {
        if !self.can_allocate(size) {
            return Err(Error::InsufficientCapacity {
                requested: size,
                available: self.free,
            });
        }
        self.free -= size;
        self.used += size;
        Ok(())
    }

    /// Return `size` KiB to the free pool
    pub fn release(&mut self, size: u64) {
        let size = if size > self.used {
            warn!(
                "Releasing {} KiB but only {} KiB are in use, clamping",
                size, self.used
            );
            self.used
        } else {
            size
        };
        self.used -= size;
        self.free += size;
    }

    pub fn is_consistent(&self) -> bool {
        self.free + self.used == self.total
    }
}

// =============================================================================
// Brick Sizing
// =============================================================================

/// Space a brick takes from its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickSize {
    /// Nominal size
    pub size: u64,
    /// Thin pool size, inflated by the snapshot factor
    pub tp_size: u64,
    /// Thin pool metadata
    pub pool_metadata_size: u64,
}

impl BrickSize {
    /// Size a brick; `snapshot_factor` is `Some` only when snapshots are enabled
    pub fn new(size: u64, snapshot_factor: Option<f64>) -> Self {
        let tp_size = match snapshot_factor {
            Some(factor) => (size as f64 * factor) as u64,
            None => size,
        };
        let pool_metadata_size = tp_size.saturating_mul(POOL_METADATA_PER_MILLE).div_ceil(1000);

        Self {
            size,
            tp_size,
            pool_metadata_size,
        }
    }

    /// Space reserved on the device
    pub fn total(&self) -> u64 {
        self.tp_size + self.pool_metadata_size
    }
}
