//! Device evacuation

use super::{remove_entry, Operation};
use crate::allocation::{BrickAllocator, Exclusions};
use crate::domain::Executor;
use crate::error::{Error, Result};
use crate::migration::evacuate_brick;
use crate::store::{
    generate_id, BrickEntry, ChangeType, DeviceEntry, Db, EntryState, OperationType, Owner,
    PendingOperationEntry,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Move every brick off an offline device, then mark it failed
pub struct DeviceRemoveOperation {
    id: String,
    db: Arc<Db>,
    allocator: BrickAllocator,
    device_id: String,
}

impl DeviceRemoveOperation {
    pub fn new(db: Arc<Db>, allocator: BrickAllocator, device_id: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            db,
            allocator,
            device_id: device_id.into(),
        }
    }

    fn next_brick(&self, handled: &HashSet<String>) -> Result<Option<BrickEntry>> {
        self.db.view(|tx| {
            let device: DeviceEntry = tx.get(&self.device_id)?;
            match device.bricks.iter().find(|id| !handled.contains(*id)) {
                Some(id) => Ok(Some(tx.get(id)?)),
                None => Ok(None),
            }
        })
    }

    fn settle(&self, state: Option<EntryState>) -> Result<()> {
        let owner = Owner::new(&self.id);
        self.db.update(|tx| {
            if let Some(mut device) = tx.try_get::<DeviceEntry>(&self.device_id)? {
                if let Some(state) = state {
                    device.state = state;
                }
                owner.release(&mut device);
                tx.put(&device)?;
            }
            remove_entry(tx, &owner.op_id)
        })
    }
}

#[async_trait]
impl Operation for DeviceRemoveOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Remove Device"
    }

    fn resource_url(&self) -> Option<String> {
        Some(format!("/devices/{}", self.device_id))
    }

    fn build(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        self.db.update(|tx| {
            let mut device: DeviceEntry = tx.get(&self.device_id)?;
            if device.state == EntryState::Online {
                return Err(Error::Conflict(format!(
                    "device {} must be offline before it can be removed",
                    device.id
                )));
            }
            owner.claim(&mut device)?;
            tx.put(&device)?;

            let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::RemoveDevice);
            entry.record_change(ChangeType::RemoveDevice, &device.id);
            tx.put(&entry)
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let mut handled = HashSet::new();

        while let Some(brick) = self.next_brick(&handled)? {
            handled.insert(brick.id.clone());
            if !brick.is_materialized() {
                warn!("Brick {} has no path, leaving it on device {}", brick.id, self.device_id);
                continue;
            }

            info!("Evacuating brick {} from device {}", brick.id, self.device_id);
            evacuate_brick(
                &self.db,
                &self.allocator,
                executor,
                &self.id,
                &brick.id,
                Exclusions::default(),
            )
            .await?;
        }
        Ok(())
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        self.settle(None)
    }

    fn finalize(&mut self) -> Result<()> {
        self.settle(Some(EntryState::Failed))?;
        info!("Device {} removed", self.device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Claimable;
    use crate::domain::{Durability, GB};
    use crate::executor::MockExecutor;
    use crate::operations::run_operation;
    use crate::operations::testing::{brick, cluster, create_volume, pending_count, volume};
    use assert_matches::assert_matches;

    const TB: u64 = 1024 * 1024 * GB;

    fn set_offline(db: &Db, device_id: &str) {
        db.update(|tx| {
            let mut device: DeviceEntry = tx.get(device_id)?;
            device.state = EntryState::Offline;
            tx.put(&device)
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_online_device_is_rejected() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 10, Durability::Replicate { replica: 3 }).await;
        let device_id = brick(&db, &vol.bricks[0]).device_id;

        let mut op = DeviceRemoveOperation::new(db.clone(), BrickAllocator::default(), &device_id);
        assert_matches!(op.build(), Err(Error::Conflict(_)));
        assert_eq!(pending_count(&db), 0);
    }

    #[tokio::test]
    async fn test_remove_evacuates_and_fails_device() {
        let (db, _) = cluster(3, 2, 6 * TB);
        let exec = MockExecutor::new();
        let vol = create_volume(&db, exec.as_ref(), 10, Durability::Replicate { replica: 3 }).await;
        let device_id = brick(&db, &vol.bricks[0]).device_id;
        set_offline(&db, &device_id);

        let mut op = DeviceRemoveOperation::new(db.clone(), BrickAllocator::default(), &device_id);
        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        let device: DeviceEntry = db.view(|tx| tx.get(&device_id)).unwrap();
        assert_eq!(device.state, EntryState::Failed);
        assert!(device.bricks.is_empty());
        assert!(!device.is_pending());
        assert_eq!(device.storage.used, 0);

        let after = volume(&db, &vol.id);
        assert_eq!(after.bricks.len(), 3);
        assert!(!after.is_pending());
        assert_eq!(pending_count(&db), 0);
    }
}
