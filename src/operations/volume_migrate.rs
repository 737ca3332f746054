//! Volume migration off a node

use super::{remove_entry, Operation};
use crate::allocation::{BrickAllocator, Exclusions};
use crate::domain::Executor;
use crate::error::Result;
use crate::migration::evacuate_brick;
use crate::store::{
    generate_id, BrickEntry, ChangeType, Db, NodeEntry, OperationType, Owner,
    PendingOperationEntry, VolumeEntry,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Move every brick of a volume that lives on one node elsewhere
///
/// Each brick moves in its own child operation; bricks already moved stay
/// moved when a later one fails.
pub struct VolumeMigrateOperation {
    id: String,
    db: Arc<Db>,
    allocator: BrickAllocator,
    volume_id: String,
    node_id: String,
}

impl VolumeMigrateOperation {
    pub fn new(
        db: Arc<Db>,
        allocator: BrickAllocator,
        volume_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            db,
            allocator,
            volume_id: volume_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Next brick of the volume still on the node
    fn next_brick(&self, handled: &HashSet<String>) -> Result<Option<BrickEntry>> {
        self.db.view(|tx| {
            let volume: VolumeEntry = tx.get(&self.volume_id)?;
            for id in &volume.bricks {
                if handled.contains(id) {
                    continue;
                }
                let brick: BrickEntry = tx.get(id)?;
                if brick.node_id == self.node_id {
                    return Ok(Some(brick));
                }
            }
            Ok(None)
        })
    }

    fn release(&self) -> Result<()> {
        let owner = Owner::new(&self.id);
        self.db.update(|tx| {
            if let Some(mut volume) = tx.try_get::<VolumeEntry>(&self.volume_id)? {
                owner.release(&mut volume);
                tx.put(&volume)?;
            }
            if let Some(mut node) = tx.try_get::<NodeEntry>(&self.node_id)? {
                owner.release(&mut node);
                tx.put(&node)?;
            }
            remove_entry(tx, &owner.op_id)
        })
    }
}

#[async_trait]
impl Operation for VolumeMigrateOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Migrate Volume from Node"
    }

    fn resource_url(&self) -> Option<String> {
        Some(format!("/volumes/{}", self.volume_id))
    }

    fn build(&mut self) -> Result<()> {
        let owner = Owner::new(&self.id);
        self.db.update(|tx| {
            let mut volume: VolumeEntry = tx.get(&self.volume_id)?;
            let mut node: NodeEntry = tx.get(&self.node_id)?;
            owner.claim(&mut volume)?;
            owner.claim(&mut node)?;
            tx.put(&volume)?;
            tx.put(&node)?;

            let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::MigrateVolume);
            entry.record_change(ChangeType::MigrateVolume, &volume.id);
            tx.put(&entry)
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let mut handled = HashSet::new();
        let mut moved = 0usize;

        while let Some(brick) = self.next_brick(&handled)? {
            handled.insert(brick.id.clone());
            if !brick.is_materialized() {
                warn!("Brick {} has no path, leaving it in place", brick.id);
                continue;
            }

            info!("Migrating brick {} off node {}", brick.id, self.node_id);
            evacuate_brick(
                &self.db,
                &self.allocator,
                executor,
                &self.id,
                &brick.id,
                Exclusions::default().node(self.node_id.clone()),
            )
            .await?;
            moved += 1;
        }

        info!(
            "Moved {} bricks of volume {} off node {}",
            moved, self.volume_id, self.node_id
        );
        Ok(())
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        self.release()
    }

    fn finalize(&mut self) -> Result<()> {
        self.release()
    }
}
