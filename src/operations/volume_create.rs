//! Volume creation

use super::bricks::{brick_infos, create_bricks, destroy_bricks, node_hosts};
use super::{remove_entry, Operation, RetryPolicy};
use crate::allocation::BrickAllocator;
use crate::domain::{Executor, VolumeRequest};
use crate::error::{Error, Result};
use crate::store::{
    generate_id, BrickEntry, ChangeType, ClusterEntry, Db, OperationType, Owner,
    PendingOperationEntry, VolumeEntry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Create a volume: place and create its bricks, then assemble them
pub struct VolumeCreateOperation {
    id: String,
    db: Arc<Db>,
    allocator: BrickAllocator,
    volume: VolumeEntry,
    /// Clusters to try, in order; empty means every cluster
    clusters: Vec<String>,
    bricks: Vec<BrickEntry>,
}

impl VolumeCreateOperation {
    pub fn new(
        db: Arc<Db>,
        allocator: BrickAllocator,
        volume: VolumeEntry,
        clusters: Vec<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            db,
            allocator,
            volume,
            clusters,
            bricks: Vec::new(),
        }
    }

    pub fn volume(&self) -> &VolumeEntry {
        &self.volume
    }

    pub fn bricks(&self) -> &[BrickEntry] {
        &self.bricks
    }
}

#[async_trait]
impl Operation for VolumeCreateOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Create Volume"
    }

    fn resource_url(&self) -> Option<String> {
        Some(format!("/volumes/{}", self.volume.id))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::Retry { max_attempts: 3 }
    }

    fn build(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);

        let (volume, bricks) = self.db.update(|tx| {
            if tx
                .list::<VolumeEntry>()?
                .iter()
                .any(|v| v.name == self.volume.name && v.id != self.volume.id)
            {
                return Err(Error::Conflict(format!(
                    "volume name {} already in use",
                    self.volume.name
                )));
            }

            let clusters = if self.clusters.is_empty() {
                tx.ids::<ClusterEntry>()
            } else {
                self.clusters.clone()
            };

            let mut last_error = Error::NoSpace("no clusters available".into());
            for cluster_id in &clusters {
                let plan = match self.allocator.plan_volume(
                    tx,
                    cluster_id,
                    &self.volume,
                    self.volume.size_kib(),
                ) {
                    Ok(plan) => plan,
                    Err(Error::NoSpace(reason)) => {
                        debug!("Cluster {} cannot hold volume: {}", cluster_id, reason);
                        last_error = Error::NoSpace(reason);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let mut volume = self.volume.clone();
                volume.cluster_id = cluster_id.clone();
                volume.pending_id = owner.op_id.clone();
                volume.bricks.clear();

                let bricks = BrickAllocator::reserve_plan(tx, &plan, &volume.id, &owner)?;
                for brick in &bricks {
                    volume.brick_add(&brick.id);
                }

                let mut cluster: ClusterEntry = tx.get(cluster_id)?;
                cluster.volume_add(&volume.id);
                tx.put(&cluster)?;
                tx.put(&volume)?;

                let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::CreateVolume);
                entry.record_change(ChangeType::AddVolume, &volume.id);
                for brick in &bricks {
                    entry.record_change(ChangeType::AddBrick, &brick.id);
                }
                tx.put(&entry)?;

                return Ok((volume, bricks));
            }

            Err(last_error)
        })?;

        info!(
            "Volume {} ({}) planned with {} bricks on cluster {}",
            volume.name,
            volume.id,
            bricks.len(),
            volume.cluster_id
        );
        self.volume = volume;
        self.bricks = bricks;
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        create_bricks(&self.db, executor, &mut self.bricks).await?;

        let first = self
            .bricks
            .first()
            .ok_or_else(|| Error::Internal(format!("volume {} has no bricks", self.volume.id)))?;
        let (host, _) = node_hosts(&self.db, &first.node_id)?;

        let request = VolumeRequest {
            name: self.volume.name.clone(),
            durability: self.volume.durability,
            bricks: brick_infos(&self.db, &self.bricks)?,
        };
        executor.volume_create(&host, &request).await?;
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        destroy_bricks(&self.db, executor, &self.bricks).await;

        let volume = &self.volume;
        let bricks = &self.bricks;
        self.db.update(|tx| {
            for brick in bricks {
                BrickAllocator::release(tx, brick)?;
            }
            if let Some(mut cluster) = tx.try_get::<ClusterEntry>(&volume.cluster_id)? {
                cluster.volume_delete(&volume.id);
                tx.put(&cluster)?;
            }
            if tx.contains::<VolumeEntry>(&volume.id) {
                tx.delete::<VolumeEntry>(&volume.id)?;
            }
            remove_entry(tx, &self.id)
        })?;

        for brick in self.bricks.iter_mut() {
            brick.path.clear();
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        let bricks = &self.bricks;
        let volume_id = &self.volume.id;

        let volume = self.db.update(|tx| {
            for brick in bricks {
                let mut brick = brick.clone();
                owner.release(&mut brick);
                tx.put(&brick)?;
            }
            let mut volume: VolumeEntry = tx.get(volume_id)?;
            owner.release(&mut volume);
            tx.put(&volume)?;
            remove_entry(tx, &owner.op_id)?;
            Ok(volume)
        })?;

        info!("Created volume {} ({})", volume.name, volume.id);
        self.volume = volume;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Claimable;
    use crate::domain::{Durability, GB};
    use crate::executor::{MockCall, MockExecutor};
    use crate::operations::run_operation;
    use crate::operations::testing::{cluster, pending_count};
    use crate::store::{DeviceEntry, SnapshotSpec};
    use assert_matches::assert_matches;

    const TB: u64 = 1024 * 1024 * GB;

    fn request(size: u64, durability: Durability) -> VolumeEntry {
        VolumeEntry::new(None, size, durability, SnapshotSpec::default())
    }

    #[tokio::test]
    async fn test_create_replicated_volume() {
        let (db, _) = cluster(3, 4, 6 * TB);
        let exec = MockExecutor::new();
        let mut op = VolumeCreateOperation::new(
            db.clone(),
            BrickAllocator::default(),
            request(1024, Durability::Replicate { replica: 3 }),
            vec![],
        );

        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        let volume = op.volume().clone();
        assert_eq!(volume.bricks.len(), 3);
        assert!(!volume.is_pending());
        assert_eq!(pending_count(&db), 0);
        assert_eq!(exec.volume_bricks(&volume.name).map(|b| b.len()), Some(3));

        db.view(|tx| {
            for id in &volume.bricks {
                let brick: BrickEntry = tx.get(id)?;
                assert!(brick.is_materialized());
                assert!(!brick.is_pending());
            }
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_volume_create_restores_capacity() {
        let (db, _) = cluster(3, 2, 6 * TB);
        let exec = MockExecutor::new();
        exec.fail_on(MockCall::VolumeCreate);
        let before = db.view(|tx| tx.list::<DeviceEntry>()).unwrap();

        let mut op = VolumeCreateOperation::new(
            db.clone(),
            BrickAllocator::default(),
            request(100, Durability::Replicate { replica: 3 }),
            vec![],
        );
        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Executor { .. }));
        let after = db.view(|tx| tx.list::<DeviceEntry>()).unwrap();
        assert_eq!(before, after);
        assert_eq!(pending_count(&db), 0);
        assert!(db.view(|tx| Ok(tx.ids::<VolumeEntry>())).unwrap().is_empty());
        assert!(db.view(|tx| Ok(tx.ids::<BrickEntry>())).unwrap().is_empty());
        assert_eq!(exec.calls(MockCall::BrickDestroy), 3);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let exec = MockExecutor::new();
        let mut first = request(10, Durability::Distribute);
        first.name = "data".into();
        let mut second = request(10, Durability::Distribute);
        second.name = "data".into();

        let mut op = VolumeCreateOperation::new(db.clone(), BrickAllocator::default(), first, vec![]);
        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        let mut op = VolumeCreateOperation::new(db.clone(), BrickAllocator::default(), second, vec![]);
        assert_matches!(op.build(), Err(Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_no_space_anywhere() {
        let (db, _) = cluster(3, 1, 10 * GB);
        let mut op = VolumeCreateOperation::new(
            db.clone(),
            BrickAllocator::default(),
            request(100, Durability::Replicate { replica: 3 }),
            vec![],
        );

        assert_matches!(op.build(), Err(Error::NoSpace(_)));
        assert_eq!(pending_count(&db), 0);
    }
}
