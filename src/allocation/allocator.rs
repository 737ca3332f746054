//! Brick Allocator
//!
//! Turns volume requests into brick-set layouts on a cluster's devices and
//! reserves them. Planning happens against an in-memory [`PlacementEngine`];
//! nothing is written to the transaction until the whole plan fits, so
//! allocation and capacity accounting stay atomic.

use super::capacity::BrickSize;
use super::placement::{Placement, PlacementCandidate, PlacementEngine};
use crate::domain::GB;
use crate::error::{Error, Result};
use crate::store::{BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, Owner, Tx, VolumeEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

// =============================================================================
// Limits
// =============================================================================

/// Bounds on brick layout, sizes in KiB
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationLimits {
    /// Bricks are never split below this size
    pub brick_min_size: u64,
    /// Bricks are never larger than this
    pub brick_max_size: u64,
    /// Upper bound on the brick count of one volume
    pub max_bricks_per_volume: usize,
}

impl Default for AllocationLimits {
    fn default() -> Self {
        Self {
            brick_min_size: GB,
            brick_max_size: 4 * 1024 * GB,
            max_bricks_per_volume: 32,
        }
    }
}

/// Devices and nodes a placement must avoid
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub devices: HashSet<String>,
    pub nodes: HashSet<String>,
}

impl Exclusions {
    pub fn device(mut self, id: impl Into<String>) -> Self {
        self.devices.insert(id.into());
        self
    }

    pub fn node(mut self, id: impl Into<String>) -> Self {
        self.nodes.insert(id.into());
        self
    }
}

/// Layout chosen for new brick-sets
#[derive(Debug, Clone)]
pub struct VolumePlan {
    pub sizing: BrickSize,
    pub sets: Vec<Vec<Placement>>,
}

impl VolumePlan {
    pub fn brick_count(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }
}

// =============================================================================
// Brick Allocator
// =============================================================================

/// Plans and reserves bricks inside a transaction
#[derive(Debug, Clone, Default)]
pub struct BrickAllocator {
    limits: AllocationLimits,
}

impl BrickAllocator {
    pub fn new(limits: AllocationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &AllocationLimits {
        &self.limits
    }

    /// Candidate devices: online devices on online nodes of the cluster
    pub fn candidates(
        tx: &Tx<'_>,
        cluster_id: &str,
        exclude: &Exclusions,
    ) -> Result<Vec<PlacementCandidate>> {
        let cluster: ClusterEntry = tx.get(cluster_id)?;
        let mut candidates = Vec::new();

        for node_id in &cluster.nodes {
            if exclude.nodes.contains(node_id) {
                continue;
            }
            let node: NodeEntry = tx.get(node_id)?;
            if !node.is_online() {
                continue;
            }
            for device_id in &node.devices {
                if exclude.devices.contains(device_id) {
                    continue;
                }
                let device: DeviceEntry = tx.get(device_id)?;
                if !device.is_online() {
                    continue;
                }
                candidates.push(PlacementCandidate {
                    node_id: node.id.clone(),
                    device_id: device.id.clone(),
                    zone: node.zone,
                    free: device.storage.free,
                });
            }
        }

        Ok(candidates)
    }

    /// Plan brick-sets holding `size` KiB of a volume on one cluster
    ///
    /// Starts with one set. On NoSpace the brick size is halved and the set
    /// count doubled until the minimum brick size or the brick count limit
    /// is reached.
    pub fn plan_volume(
        &self,
        tx: &Tx<'_>,
        cluster_id: &str,
        volume: &VolumeEntry,
        size: u64,
    ) -> Result<VolumePlan> {
        let pool = PlacementEngine::new(Self::candidates(tx, cluster_id, &Exclusions::default())?);
        if pool.is_empty() {
            return Err(Error::NoSpace(format!(
                "cluster {} has no online devices",
                cluster_id
            )));
        }

        let durability = volume.durability;
        let width = durability.bricks_in_set();
        let mut sets = 1usize;
        let mut brick_size = durability.brick_size(size, sets);
        while brick_size > self.limits.brick_max_size
            && sets <= self.limits.max_bricks_per_volume
        {
            sets *= 2;
            brick_size = durability.brick_size(size, sets);
        }

        // Existing sets shift the seeds so expansions do not retrace them
        let first_set = volume.bricks.len() / width.max(1);

        loop {
            let needed = sets
                .checked_mul(width)
                .and_then(|n| n.checked_add(volume.bricks.len()));
            if !matches!(needed, Some(n) if n <= self.limits.max_bricks_per_volume) {
                return Err(Error::NoSpace(format!(
                    "volume {} would need more than {} bricks",
                    volume.id, self.limits.max_bricks_per_volume
                )));
            }

            let sizing = BrickSize::new(brick_size, volume.snapshot_factor());
            match Self::place_sets(pool.clone(), &volume.id, first_set, sets, width, sizing) {
                Ok(placed) => {
                    info!(
                        "Planned {} brick-sets of {} x {} KiB for volume {}",
                        sets, width, brick_size, volume.id
                    );
                    return Ok(VolumePlan {
                        sizing,
                        sets: placed,
                    });
                }
                Err(Error::NoSpace(reason)) => {
                    debug!(
                        "Layout of {} sets for volume {} does not fit: {}",
                        sets, volume.id, reason
                    );
                    brick_size /= 2;
                    sets *= 2;
                    if brick_size < self.limits.brick_min_size {
                        return Err(Error::NoSpace(format!(
                            "minimum brick size reached while placing volume {}",
                            volume.id
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn place_sets(
        mut pool: PlacementEngine,
        volume_id: &str,
        first_set: usize,
        sets: usize,
        width: usize,
        sizing: BrickSize,
    ) -> Result<Vec<Vec<Placement>>> {
        (first_set..first_set + sets)
            .map(|set| {
                let seed = format!("{}-{}", volume_id, set);
                pool.select_set(&seed, width, sizing.total(), &[])
            })
            .collect()
    }

    /// Place a replacement for `old` among the other members of its set
    pub fn plan_replacement(
        &self,
        tx: &Tx<'_>,
        cluster_id: &str,
        volume: &VolumeEntry,
        old: &BrickEntry,
        exclude: Exclusions,
    ) -> Result<Placement> {
        let exclude = exclude.device(old.device_id.clone());
        let mut pool = PlacementEngine::new(Self::candidates(tx, cluster_id, &exclude)?);

        let mut siblings = Vec::new();
        for id in volume.brick_set_of(&old.id).unwrap_or_default() {
            if *id == old.id {
                continue;
            }
            let brick: BrickEntry = tx.get(id)?;
            let node: NodeEntry = tx.get(&brick.node_id)?;
            siblings.push(Placement {
                node_id: node.id,
                device_id: brick.device_id,
                zone: node.zone,
            });
        }

        let mut placed = pool
            .select_set(&old.id, 1, old.total_size(), &siblings)
            .map_err(|_| {
                Error::NoSpace(format!("no replacement device available for brick {}", old.id))
            })?;
        placed
            .pop()
            .ok_or_else(|| Error::Internal("placement returned an empty set".into()))
    }

    /// Create a brick entry on the chosen device and reserve its space
    pub fn reserve(
        tx: &mut Tx<'_>,
        placement: &Placement,
        sizing: BrickSize,
        volume_id: &str,
        owner: &Owner,
    ) -> Result<BrickEntry> {
        let mut device: DeviceEntry = tx.get(&placement.device_id)?;
        device.storage_allocate(sizing.total())?;

        let mut brick = BrickEntry::new(sizing, &device.id, &device.node_id, volume_id);
        brick.pending_id = owner.op_id.clone();
        device.brick_add(&brick.id);

        tx.put(&device)?;
        tx.put(&brick)?;
        Ok(brick)
    }

    /// Reserve every brick of a plan, in set order
    pub fn reserve_plan(
        tx: &mut Tx<'_>,
        plan: &VolumePlan,
        volume_id: &str,
        owner: &Owner,
    ) -> Result<Vec<BrickEntry>> {
        let mut bricks = Vec::with_capacity(plan.brick_count());
        for placement in plan.sets.iter().flatten() {
            bricks.push(Self::reserve(tx, placement, plan.sizing, volume_id, owner)?);
        }
        Ok(bricks)
    }

    /// Return a brick's space to its device and drop the brick entry
    pub fn release(tx: &mut Tx<'_>, brick: &BrickEntry) -> Result<()> {
        if let Some(mut device) = tx.try_get::<DeviceEntry>(&brick.device_id)? {
            device.storage_free(brick.total_size());
            device.brick_delete(&brick.id);
            tx.put(&device)?;
        }
        if tx.contains::<BrickEntry>(&brick.id) {
            tx.delete::<BrickEntry>(&brick.id)?;
        }
        Ok(())
    }

    /// Drop a brick entry whose space could not be reclaimed on the node
    pub fn forget(tx: &mut Tx<'_>, brick: &BrickEntry) -> Result<()> {
        if let Some(mut device) = tx.try_get::<DeviceEntry>(&brick.device_id)? {
            device.brick_delete(&brick.id);
            tx.put(&device)?;
        }
        if tx.contains::<BrickEntry>(&brick.id) {
            tx.delete::<BrickEntry>(&brick.id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Durability;
    use crate::store::{Db, Hostnames, SnapshotSpec};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const TB: u64 = 1024 * 1024 * GB;

    /// One cluster, `nodes` nodes in their own zones, `devices` devices each
    fn cluster(nodes: usize, devices: usize, device_size: u64) -> (Arc<Db>, String) {
        let db = Db::in_memory();
        let cluster_id = db
            .update(|tx| {
                let mut cluster = ClusterEntry::new();
                for n in 0..nodes {
                    let mut node = NodeEntry::new(
                        &cluster.id,
                        Hostnames {
                            manage: vec![format!("node{}", n)],
                            storage: vec![format!("10.0.0.{}", n)],
                        },
                        n as u32 + 1,
                    );
                    for d in 0..devices {
                        let mut device = DeviceEntry::new(&node.id, format!("/dev/sd{}", d), 0);
                        device.storage_set(device_size);
                        node.device_add(&device.id);
                        tx.put(&device)?;
                    }
                    cluster.node_add(&node.id);
                    tx.put(&node)?;
                }
                tx.put(&cluster)?;
                Ok(cluster.id)
            })
            .unwrap();
        (db, cluster_id)
    }

    fn volume(size: u64, durability: Durability) -> VolumeEntry {
        VolumeEntry::new(None, size, durability, SnapshotSpec::default())
    }

    #[test]
    fn test_plan_single_set() {
        let (db, cluster_id) = cluster(3, 4, 6 * TB);
        let vol = volume(1024, Durability::Replicate { replica: 3 });
        let allocator = BrickAllocator::default();

        let plan = db
            .view(|tx| allocator.plan_volume(tx, &cluster_id, &vol, vol.size_kib()))
            .unwrap();

        assert_eq!(plan.sets.len(), 1);
        assert_eq!(plan.brick_count(), 3);
        let nodes: HashSet<_> = plan.sets[0].iter().map(|p| p.node_id.clone()).collect();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_plan_splits_when_devices_are_small() {
        let (db, cluster_id) = cluster(3, 2, 60 * GB);
        let vol = volume(100, Durability::Replicate { replica: 3 });
        let allocator = BrickAllocator::default();

        let plan = db
            .view(|tx| allocator.plan_volume(tx, &cluster_id, &vol, vol.size_kib()))
            .unwrap();

        assert_eq!(plan.sets.len(), 2);
        assert_eq!(plan.sizing.size, 50 * GB);
    }

    #[test]
    fn test_plan_respects_brick_limit() {
        let (db, cluster_id) = cluster(3, 1, 10 * GB);
        let vol = volume(100, Durability::Replicate { replica: 3 });
        let allocator = BrickAllocator::new(AllocationLimits {
            max_bricks_per_volume: 6,
            ..Default::default()
        });

        let result = db.view(|tx| allocator.plan_volume(tx, &cluster_id, &vol, vol.size_kib()));
        assert_matches!(result, Err(Error::NoSpace(_)));
    }

    #[test]
    fn test_reserve_and_release_are_symmetric() {
        let (db, cluster_id) = cluster(3, 1, 6 * TB);
        let vol = volume(10, Durability::Replicate { replica: 3 });
        let allocator = BrickAllocator::default();
        let owner = Owner::new("op");

        let bricks = db
            .update(|tx| {
                let plan = allocator.plan_volume(tx, &cluster_id, &vol, vol.size_kib())?;
                BrickAllocator::reserve_plan(tx, &plan, &vol.id, &owner)
            })
            .unwrap();
        assert_eq!(bricks.len(), 3);

        db.view(|tx| {
            for brick in &bricks {
                let device: DeviceEntry = tx.get(&brick.device_id)?;
                assert_eq!(device.storage.used, brick.total_size());
                assert!(device.storage.is_consistent());
            }
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            for brick in &bricks {
                BrickAllocator::release(tx, brick)?;
            }
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            for device in tx.list::<DeviceEntry>()? {
                assert_eq!(device.storage.free, 6 * TB);
                assert!(device.bricks.is_empty());
            }
            assert!(tx.ids::<BrickEntry>().is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_offline_nodes_are_skipped() {
        let (db, cluster_id) = cluster(2, 1, 6 * TB);
        db.update(|tx| {
            let cluster: ClusterEntry = tx.get(&cluster_id)?;
            let mut node: NodeEntry = tx.get(&cluster.nodes[0])?;
            node.state = crate::store::EntryState::Offline;
            tx.put(&node)
        })
        .unwrap();

        let candidates = db
            .view(|tx| BrickAllocator::candidates(tx, &cluster_id, &Exclusions::default()))
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }
}
