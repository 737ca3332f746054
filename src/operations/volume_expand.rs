//! Volume expansion

use super::bricks::{brick_infos, create_bricks, destroy_bricks};
use super::{remove_entry, Operation};
use crate::allocation::BrickAllocator;
use crate::domain::{Executor, GB};
use crate::error::{Error, Result};
use crate::migration::command_host;
use crate::store::{
    generate_id, BrickEntry, ChangeType, Db, OperationType, Owner, PendingOperationEntry,
    VolumeEntry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Grow a volume by adding brick-sets
pub struct VolumeExpandOperation {
    id: String,
    db: Arc<Db>,
    allocator: BrickAllocator,
    volume_id: String,
    /// GiB to add
    size: u64,
    volume: Option<VolumeEntry>,
    bricks: Vec<BrickEntry>,
}

impl VolumeExpandOperation {
    pub fn new(
        db: Arc<Db>,
        allocator: BrickAllocator,
        volume_id: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: generate_id(),
            db,
            allocator,
            volume_id: volume_id.into(),
            size,
            volume: None,
            bricks: Vec::new(),
        }
    }

    fn volume(&self) -> Result<&VolumeEntry> {
        self.volume
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("expand operation {} was not built", self.id)))
    }
}

#[async_trait]
impl Operation for VolumeExpandOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Expand Volume"
    }

    fn resource_url(&self) -> Option<String> {
        Some(format!("/volumes/{}", self.volume_id))
    }

    fn build(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        let allocator = &self.allocator;
        let volume_id = &self.volume_id;
        let size = self.size;

        let (volume, bricks) = self.db.update(|tx| {
            let mut volume: VolumeEntry = tx.get(volume_id)?;
            owner.claim(&mut volume)?;

            let plan = allocator.plan_volume(tx, &volume.cluster_id, &volume, size.saturating_mul(GB))?;
            let bricks = BrickAllocator::reserve_plan(tx, &plan, &volume.id, &owner)?;
            tx.put(&volume)?;

            let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::ExpandVolume);
            entry.record_change(ChangeType::ExpandVolume, &volume.id);
            for brick in &bricks {
                entry.record_change(ChangeType::AddBrick, &brick.id);
            }
            tx.put(&entry)?;

            Ok((volume, bricks))
        })?;

        info!(
            "Volume {} grows by {} GiB with {} new bricks",
            volume.name,
            size,
            bricks.len()
        );
        self.volume = Some(volume);
        self.bricks = bricks;
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        create_bricks(&self.db, executor, &mut self.bricks).await?;

        let volume = self.volume()?;
        let first = volume.bricks.first().map(String::as_str);
        let preferred = match first {
            Some(id) => Some(self.db.view(|tx| tx.get::<BrickEntry>(id))?.node_id),
            None => None,
        };
        let host =
            command_host(&self.db, executor, preferred.as_deref(), &volume.cluster_id).await?;

        let infos = brick_infos(&self.db, &self.bricks)?;
        executor
            .volume_add_brick(&host, &volume.name, &infos, volume.durability.replica())
            .await?;
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        destroy_bricks(&self.db, executor, &self.bricks).await;

        let owner = Owner::new(&self.id);
        let volume_id = &self.volume_id;
        let bricks = &self.bricks;
        self.db.update(|tx| {
            for brick in bricks {
                BrickAllocator::release(tx, brick)?;
            }
            if let Some(mut volume) = tx.try_get::<VolumeEntry>(volume_id)? {
                owner.release(&mut volume);
                tx.put(&volume)?;
            }
            remove_entry(tx, &owner.op_id)
        })
    }

    fn finalize(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        let volume_id = &self.volume_id;
        let bricks = &self.bricks;
        let size = self.size;

        let volume = self.db.update(|tx| {
            let mut volume: VolumeEntry = tx.get(volume_id)?;
            for brick in bricks {
                let mut brick = brick.clone();
                owner.release(&mut brick);
                volume.brick_add(&brick.id);
                tx.put(&brick)?;
            }
            volume.size += size;
            owner.release(&mut volume);
            tx.put(&volume)?;
            remove_entry(tx, &owner.op_id)?;
            Ok(volume)
        })?;

        info!("Volume {} expanded to {} GiB", volume.name, volume.size);
        self.volume = Some(volume);
        Ok(())
    }
}
