//! Brick replacement

use super::bricks::destroy_bricks;
use super::{remove_entry, Operation};
use crate::allocation::{BrickAllocator, Exclusions};
use crate::domain::Executor;
use crate::error::{Error, Result};
use crate::migration::replace_brick;
use crate::store::{
    generate_id, BrickEntry, ChangeType, Db, OperationType, Owner, PendingOperationEntry,
    VolumeEntry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Move one brick of a volume to another device
///
/// A brick that was never created on its node is skipped: every phase
/// becomes a no-op.
pub struct BrickReplaceOperation {
    id: String,
    db: Arc<Db>,
    allocator: BrickAllocator,
    owner: Owner,
    brick_id: String,
    exclude: Exclusions,
    skipped: bool,
    volume: Option<VolumeEntry>,
    old: Option<BrickEntry>,
    new: Option<BrickEntry>,
    reclaimed: bool,
}

impl BrickReplaceOperation {
    pub fn new(db: Arc<Db>, allocator: BrickAllocator, brick_id: impl Into<String>) -> Self {
        let id = generate_id();
        Self::with_owner(db, allocator, Owner::new(&id), id, brick_id.into(), Exclusions::default())
    }

    /// Replacement run on behalf of a migrate or device-remove operation
    pub fn child(
        db: Arc<Db>,
        allocator: BrickAllocator,
        parent_id: &str,
        brick_id: impl Into<String>,
        exclude: Exclusions,
    ) -> Self {
        let id = generate_id();
        Self::with_owner(
            db,
            allocator,
            Owner::child(&id, parent_id),
            id,
            brick_id.into(),
            exclude,
        )
    }

    fn with_owner(
        db: Arc<Db>,
        allocator: BrickAllocator,
        owner: Owner,
        id: String,
        brick_id: String,
        exclude: Exclusions,
    ) -> Self {
        Self {
            id,
            db,
            allocator,
            owner,
            brick_id,
            exclude,
            skipped: false,
            volume: None,
            old: None,
            new: None,
            reclaimed: false,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    /// The brick taking over, once Build placed it
    pub fn new_brick(&self) -> Option<&BrickEntry> {
        self.new.as_ref()
    }

    fn parts(&self) -> Result<(&VolumeEntry, &BrickEntry, &BrickEntry)> {
        match (&self.volume, &self.old, &self.new) {
            (Some(volume), Some(old), Some(new)) => Ok((volume, old, new)),
            _ => Err(Error::Internal(format!(
                "replace operation {} was not built",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl Operation for BrickReplaceOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Replace Brick"
    }

    fn resource_url(&self) -> Option<String> {
        None
    }

    fn build(&mut self) -> Result<()> {
        let owner = &self.owner;
        let allocator = &self.allocator;
        let brick_id = &self.brick_id;
        let exclude = &self.exclude;

        let built = self.db.update(|tx| {
            let mut old: BrickEntry = tx.get(brick_id)?;
            if !old.is_materialized() {
                return Ok(None);
            }

            let mut volume: VolumeEntry = tx.get(&old.volume_id)?;
            owner.claim(&mut volume)?;
            owner.claim(&mut old)?;

            let placement =
                allocator.plan_replacement(tx, &volume.cluster_id, &volume, &old, exclude.clone())?;
            let new = BrickAllocator::reserve(tx, &placement, old.sizing(), &volume.id, owner)?;

            tx.put(&volume)?;
            tx.put(&old)?;

            let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::ReplaceBrick);
            entry.record_change(ChangeType::AddBrick, &new.id);
            entry.record_change(ChangeType::DeleteBrick, &old.id);
            tx.put(&entry)?;

            Ok(Some((volume, old, new)))
        })?;

        match built {
            Some((volume, old, new)) => {
                info!(
                    "Brick {} of volume {} will move to device {}",
                    old.id, volume.name, new.device_id
                );
                self.volume = Some(volume);
                self.old = Some(old);
                self.new = Some(new);
            }
            None => {
                warn!("Brick {} has no path, skipping replacement", self.brick_id);
                self.skipped = true;
            }
        }
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        let (volume, old, _) = self.parts()?;
        let (volume, old) = (volume.clone(), old.clone());
        let new = self
            .new
            .as_mut()
            .ok_or_else(|| Error::Internal("replacement brick missing".into()))?;

        self.reclaimed = replace_brick(&self.db, executor, &volume, &old, new).await?;
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        let (volume, old, new) = self.parts()?;
        destroy_bricks(&self.db, executor, std::slice::from_ref(new)).await;

        let owner = &self.owner;
        self.db.update(|tx| {
            BrickAllocator::release(tx, new)?;
            if let Some(mut volume) = tx.try_get::<VolumeEntry>(&volume.id)? {
                owner.release(&mut volume);
                tx.put(&volume)?;
            }
            if let Some(mut old) = tx.try_get::<BrickEntry>(&old.id)? {
                owner.release(&mut old);
                tx.put(&old)?;
            }
            remove_entry(tx, &owner.op_id)
        })
    }

    fn finalize(&mut self) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        let (volume, old, new) = self.parts()?;
        let owner = &self.owner;
        let reclaimed = self.reclaimed;

        self.db.update(|tx| {
            let mut new = new.clone();
            new.pending_id.clear();
            tx.put(&new)?;

            let mut volume: VolumeEntry = tx.get(&volume.id)?;
            if !volume.brick_replace(&old.id, &new.id) {
                return Err(Error::Internal(format!(
                    "brick {} vanished from volume {}",
                    old.id, volume.id
                )));
            }
            owner.release(&mut volume);
            tx.put(&volume)?;

            let old: BrickEntry = tx.get(&old.id)?;
            if reclaimed {
                BrickAllocator::release(tx, &old)?;
            } else {
                BrickAllocator::forget(tx, &old)?;
            }
            remove_entry(tx, &owner.op_id)
        })?;

        info!("Replaced brick {} with {}", old.id, new.id);
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
    use crate::operations::testing::{brick, cluster, create_volume, pending_count, volume};
    use crate::store::DeviceEntry;
    use assert_matches::assert_matches;

    const TB: u64 = 1024 * 1024 * GB;

    #[tokio::test]
    async fn test_replace_keeps_set_position() {
        let (db, _) = cluster(4, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 100, Durability::Replicate { replica: 3 }).await;
        let old = brick(&db, &vol.bricks[1]);

        let mut op = BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &old.id);
        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        let after = volume(&db, &vol.id);
        let new_id = op.new_brick().unwrap().id.clone();
        assert_eq!(after.bricks[1], new_id);
        assert_eq!(after.bricks[0], vol.bricks[0]);
        assert!(!after.is_pending());
        assert_eq!(pending_count(&db), 0);

        let new = brick(&db, &new_id);
        assert_ne!(new.node_id, old.node_id);
        assert!(new.is_materialized());

        db.view(|tx| {
            assert!(!tx.contains::<BrickEntry>(&old.id));
            let device: DeviceEntry = tx.get(&old.device_id)?;
            assert_eq!(device.storage.free, 6 * TB);
            assert!(device.storage.is_consistent());
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_unreclaimed_space_stays_used() {
        let (db, _) = cluster(4, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 100, Durability::Replicate { replica: 3 }).await;
        let old = brick(&db, &vol.bricks[0]);
        exec.set_reclaim_space(false);

        let mut op = BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &old.id);
        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        let device: DeviceEntry = db.view(|tx| tx.get(&old.device_id)).unwrap();
        assert_eq!(device.storage.used, old.total_size());
        assert!(device.bricks.is_empty());
    }

    #[tokio::test]
    async fn test_only_heal_source_is_protected() {
        let (db, _) = cluster(4, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 100, Durability::Replicate { replica: 3 }).await;
        let old = brick(&db, &vol.bricks[0]);
        let info = crate::operations::bricks::brick_info(&db, &old).unwrap();
        exec.set_heal_entries(info, Some(12));

        let mut op = BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &old.id);
        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Conflict(_)));
        assert_eq!(volume(&db, &vol.id), vol);
        assert_eq!(pending_count(&db), 0);
        assert_eq!(db.view(|tx| Ok(tx.ids::<BrickEntry>().len())).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_busy_volume_is_untouched() {
        let (db, _) = cluster(4, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 100, Durability::Replicate { replica: 3 }).await;
        db.update(|tx| {
            let mut v: VolumeEntry = tx.get(&vol.id)?;
            v.pending_id = "someone-else".into();
            tx.put(&v)
        })
        .unwrap();
        let devices_before = db.view(|tx| tx.list::<DeviceEntry>()).unwrap();

        let mut op =
            BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &vol.bricks[0]);
        assert_matches!(op.build(), Err(Error::Busy { kind: "volume", .. }));

        assert_eq!(db.view(|tx| tx.list::<DeviceEntry>()).unwrap(), devices_before);
        assert_eq!(pending_count(&db), 0);
    }

    #[tokio::test]
    async fn test_replace_command_failure_rolls_back() {
        let (db, _) = cluster(4, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 100, Durability::Replicate { replica: 3 }).await;
        let devices_before = db.view(|tx| tx.list::<DeviceEntry>()).unwrap();
        let running_before = exec.volume_bricks(&vol.name);
        exec.fail_on(MockCall::VolumeReplaceBrick);

        let mut op =
            BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &vol.bricks[0]);
        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Executor { .. }));
        assert_eq!(volume(&db, &vol.id), vol);
        assert_eq!(pending_count(&db), 0);
        assert_eq!(db.view(|tx| tx.list::<DeviceEntry>()).unwrap(), devices_before);
        assert_eq!(db.view(|tx| Ok(tx.ids::<BrickEntry>().len())).unwrap(), 3);
        assert_eq!(exec.volume_bricks(&vol.name), running_before);
    }

    #[tokio::test]
    async fn test_distribute_remove_failure_after_add_is_terminal() {
        let (db, _) = cluster(2, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 10, Durability::Distribute).await;
        exec.fail_on(MockCall::VolumeRemoveBrick);

        let mut op =
            BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &vol.bricks[0]);
        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Unrecoverable { .. }));
        assert_eq!(exec.calls(MockCall::VolumeAddBrick), 1);
        let pending: Vec<PendingOperationEntry> =
            db.view(|tx| tx.list::<PendingOperationEntry>()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, crate::store::PendingStatus::Failed);
        assert_eq!(volume(&db, &vol.id).pending_id, op.id());
        assert_eq!(brick(&db, &vol.bricks[0]).pending_id, op.id());
    }

    #[tokio::test]
    async fn test_distribute_replace_uses_add_and_remove() {
        let (db, _) = cluster(2, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 10, Durability::Distribute).await;

        let mut op =
            BrickReplaceOperation::new(db.clone(), BrickAllocator::default(), &vol.bricks[0]);
        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        assert_eq!(exec.calls(MockCall::VolumeAddBrick), 1);
        assert_eq!(exec.calls(MockCall::VolumeRemoveBrick), 1);
        assert_eq!(exec.calls(MockCall::HealInfo), 0);
        assert_eq!(exec.volume_bricks(&vol.name).map(|b| b.len()), Some(1));
    }
}
