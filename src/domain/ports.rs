//! Domain Ports - Core trait definitions for brickd
//!
//! The executor port is the boundary between the pending-operation engine and
//! live storage nodes. Adapters in [`crate::executor`] implement it.

use crate::domain::Durability;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Brick Types
// =============================================================================

/// Request to materialize or tear down one brick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickRequest {
    /// Brick id, used to name the logical volumes and mount point
    pub id: String,
    /// Volume group id (the id of the owning device)
    pub vg_id: String,
    /// Nominal size in KiB
    pub size: u64,
    /// Thin pool size in KiB
    pub tp_size: u64,
    /// Thin pool metadata size in KiB
    pub pool_metadata_size: u64,
    /// Mounted brick path, empty before creation
    pub path: String,
}

/// Location of a brick as seen by the storage cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrickInfo {
    /// Storage hostname of the node holding the brick
    pub host: String,
    /// Brick directory
    pub path: String,
}

impl BrickInfo {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for BrickInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.path)
    }
}

// =============================================================================
// Device Types
// =============================================================================

/// Result of preparing a raw device for brick allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Usable size in KiB
    pub size: u64,
}

// =============================================================================
// Volume Types
// =============================================================================

/// Request to create a volume from already materialized bricks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub durability: Durability,
    /// Bricks in brick-set order
    pub bricks: Vec<BrickInfo>,
}

/// Volume membership as reported by the running cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub bricks: Vec<BrickInfo>,
}

impl VolumeInfo {
    /// Check whether the running volume contains a brick
    pub fn contains(&self, brick: &BrickInfo) -> bool {
        self.bricks.iter().any(|b| b == brick)
    }
}

/// Heal status of one brick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickHealStatus {
    pub brick: BrickInfo,
    /// Entries waiting to be healed from this brick, `None` when the brick is down
    pub entries: Option<u64>,
}

/// Heal status of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealInfo {
    pub bricks: Vec<BrickHealStatus>,
}

impl HealInfo {
    /// Pending heal entries for a brick, `None` if unknown or down
    pub fn entries_for(&self, brick: &BrickInfo) -> Option<u64> {
        self.bricks
            .iter()
            .find(|s| &s.brick == brick)
            .and_then(|s| s.entries)
    }
}

// =============================================================================
// Executor Port
// =============================================================================

/// Port for commands run against storage nodes
///
/// `host` is always the manage hostname of the node that runs the command.
/// Every failure is reported as [`crate::Error::Executor`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Check the storage daemon on a host answers
    async fn glusterd_check(&self, host: &str) -> Result<()>;

    /// Prepare a raw device as a volume group
    async fn device_setup(&self, host: &str, device: &str, vg_id: &str) -> Result<DeviceInfo>;

    /// Remove the volume group from a device
    async fn device_teardown(&self, host: &str, device: &str, vg_id: &str) -> Result<()>;

    /// Create, format and mount a brick
    async fn brick_create(&self, host: &str, brick: &BrickRequest) -> Result<BrickInfo>;

    /// Unmount and delete a brick; returns whether its space was reclaimed
    async fn brick_destroy(&self, host: &str, brick: &BrickRequest) -> Result<bool>;

    /// Create and start a volume
    async fn volume_create(&self, host: &str, volume: &VolumeRequest) -> Result<VolumeInfo>;

    /// Stop and delete a volume
    async fn volume_destroy(&self, host: &str, volume: &str) -> Result<()>;

    /// Add bricks to a running volume
    async fn volume_add_brick(
        &self,
        host: &str,
        volume: &str,
        bricks: &[BrickInfo],
        replica: Option<usize>,
    ) -> Result<()>;

    /// Remove a brick; with `replica` the replica count is reduced to that value
    async fn volume_remove_brick(
        &self,
        host: &str,
        volume: &str,
        brick: &BrickInfo,
        replica: Option<usize>,
    ) -> Result<()>;

    /// Swap one brick for another in place
    async fn volume_replace_brick(
        &self,
        host: &str,
        volume: &str,
        old: &BrickInfo,
        new: &BrickInfo,
    ) -> Result<()>;

    /// Brick membership of a running volume
    async fn volume_info(&self, host: &str, volume: &str) -> Result<VolumeInfo>;

    /// Per-brick heal status of a running volume
    async fn heal_info(&self, host: &str, volume: &str) -> Result<HealInfo>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ExecutorRef = Arc<dyn Executor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brick_info_display() {
        let brick = BrickInfo::new("10.0.0.1", "/var/lib/bricks/b1/brick");
        assert_eq!(format!("{}", brick), "10.0.0.1:/var/lib/bricks/b1/brick");
    }

    #[test]
    fn test_heal_entries_lookup() {
        let a = BrickInfo::new("h1", "/a");
        let b = BrickInfo::new("h2", "/b");
        let heal = HealInfo {
            bricks: vec![
                BrickHealStatus {
                    brick: a.clone(),
                    entries: Some(4),
                },
                BrickHealStatus {
                    brick: b.clone(),
                    entries: None,
                },
            ],
        };
        assert_eq!(heal.entries_for(&a), Some(4));
        assert_eq!(heal.entries_for(&b), None);
        assert_eq!(heal.entries_for(&BrickInfo::new("h3", "/c")), None);
    }
}
