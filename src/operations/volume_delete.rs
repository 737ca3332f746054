//! Volume deletion

use super::bricks::destroy_bricks;
use super::{remove_entry, Operation};
use crate::allocation::BrickAllocator;
use crate::domain::Executor;
use crate::error::{Error, Result};
use crate::migration::command_host;
use crate::store::{
    generate_id, BrickEntry, ChangeType, ClusterEntry, Db, OperationType, Owner,
    PendingOperationEntry, VolumeEntry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Tear down a volume and return the space of its bricks
pub struct VolumeDeleteOperation {
    id: String,
    db: Arc<Db>,
    volume_id: String,
    volume: Option<VolumeEntry>,
    bricks: Vec<BrickEntry>,
    reclaimed: Vec<bool>,
}

impl VolumeDeleteOperation {
    pub fn new(db: Arc<Db>, volume_id: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            db,
            volume_id: volume_id.into(),
            volume: None,
            bricks: Vec::new(),
            reclaimed: Vec::new(),
        }
    }

    fn volume(&self) -> Result<&VolumeEntry> {
        self.volume
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("delete operation {} was not built", self.id)))
    }
}

#[async_trait]
impl Operation for VolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Delete Volume"
    }

    fn resource_url(&self) -> Option<String> {
        None
    }

    fn build(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        let volume_id = &self.volume_id;

        let (volume, bricks) = self.db.update(|tx| {
            let mut volume: VolumeEntry = tx.get(volume_id)?;
            owner.claim(&mut volume)?;

            let mut bricks = Vec::with_capacity(volume.bricks.len());
            for id in &volume.bricks {
                let mut brick: BrickEntry = tx.get(id)?;
                owner.claim(&mut brick)?;
                tx.put(&brick)?;
                bricks.push(brick);
            }
            tx.put(&volume)?;

            let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::DeleteVolume);
            entry.record_change(ChangeType::DeleteVolume, &volume.id);
            for brick in &bricks {
                entry.record_change(ChangeType::DeleteBrick, &brick.id);
            }
            tx.put(&entry)?;

            Ok((volume, bricks))
        })?;

        self.volume = Some(volume);
        self.bricks = bricks;
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let volume = self.volume()?;
        let preferred = self.bricks.first().map(|b| b.node_id.as_str());
        let host = command_host(&self.db, executor, preferred, &volume.cluster_id).await?;

        // Once the volume is gone nothing can be undone; brick failures are
        // only reflected in the reclaimed flags
        executor.volume_destroy(&host, &volume.name).await?;
        info!("Destroyed volume {} on {}", volume.name, host);

        self.reclaimed = destroy_bricks(&self.db, executor, &self.bricks).await;
        Ok(())
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        let owner = Owner::new(&self.id);
        let volume_id = &self.volume_id;
        let bricks = &self.bricks;

        self.db.update(|tx| {
            if let Some(mut volume) = tx.try_get::<VolumeEntry>(volume_id)? {
                owner.release(&mut volume);
                tx.put(&volume)?;
            }
            for brick in bricks {
                if let Some(mut brick) = tx.try_get::<BrickEntry>(&brick.id)? {
                    owner.release(&mut brick);
                    tx.put(&brick)?;
                }
            }
            remove_entry(tx, &owner.op_id)
        })
    }

    fn finalize(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        let volume = self.volume()?;
        let bricks = &self.bricks;
        let reclaimed = &self.reclaimed;

        self.db.update(|tx| {
            for (i, brick) in bricks.iter().enumerate() {
                if reclaimed.get(i).copied().unwrap_or(false) {
                    BrickAllocator::release(tx, brick)?;
                } else {
                    BrickAllocator::forget(tx, brick)?;
                }
            }
            if let Some(mut cluster) = tx.try_get::<ClusterEntry>(&volume.cluster_id)? {
                cluster.volume_delete(&volume.id);
                tx.put(&cluster)?;
            }
            tx.delete::<VolumeEntry>(&volume.id)?;
            remove_entry(tx, &owner.op_id)
        })?;

        info!("Deleted volume {} ({})", volume.name, volume.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Durability, GB};
    use crate::executor::{MockCall, MockExecutor};
    use crate::operations::run_operation;
    use crate::operations::testing::{cluster, create_volume, pending_count, volume};
    use crate::store::DeviceEntry;
    use assert_matches::assert_matches;

    const TB: u64 = 1024 * 1024 * GB;

    #[tokio::test]
    async fn test_delete_returns_capacity() {
        let (db, cluster_id) = cluster(3, 2, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 100, Durability::Replicate { replica: 3 }).await;

        let mut op = VolumeDeleteOperation::new(db.clone(), &vol.id);
        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        db.view(|tx| {
            assert!(tx.ids::<VolumeEntry>().is_empty());
            assert!(tx.ids::<BrickEntry>().is_empty());
            for device in tx.list::<DeviceEntry>()? {
                assert_eq!(device.storage.free, 6 * TB);
            }
            let cluster: ClusterEntry = tx.get(&cluster_id)?;
            assert!(cluster.volumes.is_empty());
            Ok(())
        })
        .unwrap();
        assert_eq!(pending_count(&db), 0);
        assert!(exec.volume_bricks(&vol.name).is_none());
    }

    #[tokio::test]
    async fn test_failed_destroy_keeps_volume() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 10, Durability::Replicate { replica: 3 }).await;
        exec.fail_once(MockCall::VolumeDestroy);

        let mut op = VolumeDeleteOperation::new(db.clone(), &vol.id);
        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Executor { .. }));
        assert_eq!(volume(&db, &vol.id), vol);
        assert_eq!(pending_count(&db), 0);
    }

    #[tokio::test]
    async fn test_delete_of_busy_volume() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 10, Durability::Replicate { replica: 3 }).await;

        let mut first = VolumeDeleteOperation::new(db.clone(), &vol.id);
        first.build().unwrap();
        let mut second = VolumeDeleteOperation::new(db.clone(), &vol.id);
        assert_matches!(second.build(), Err(Error::Busy { .. }));
        assert_eq!(pending_count(&db), 1);
    }
}
