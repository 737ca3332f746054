//! Brick removal

use super::{remove_entry, Operation};
use crate::allocation::BrickAllocator;
use crate::domain::{Durability, Executor};
use crate::error::{Error, Result};
use crate::migration::remove_brick;
use crate::store::{
    generate_id, BrickEntry, ChangeType, Db, OperationType, Owner, PendingOperationEntry,
    VolumeEntry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Drop a brick from a replicated volume, lowering its replica count
///
/// A volume left with a single copy becomes a distribute volume.
pub struct BrickRemoveOperation {
    id: String,
    db: Arc<Db>,
    owner: Owner,
    brick_id: String,
    skipped: bool,
    volume: Option<VolumeEntry>,
    brick: Option<BrickEntry>,
    reclaimed: bool,
}

impl BrickRemoveOperation {
    pub fn new(db: Arc<Db>, brick_id: impl Into<String>) -> Self {
        let id = generate_id();
        let owner = Owner::new(&id);
        Self::with_owner(db, owner, id, brick_id.into())
    }

    /// Removal run on behalf of a migrate or device-remove operation
    pub fn child(db: Arc<Db>, parent_id: &str, brick_id: impl Into<String>) -> Self {
        let id = generate_id();
        let owner = Owner::child(&id, parent_id);
        Self::with_owner(db, owner, id, brick_id.into())
    }

    fn with_owner(db: Arc<Db>, owner: Owner, id: String, brick_id: String) -> Self {
        Self {
            id,
            db,
            owner,
            brick_id,
            skipped: false,
            volume: None,
            brick: None,
            reclaimed: false,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    fn parts(&self) -> Result<(&VolumeEntry, &BrickEntry)> {
        match (&self.volume, &self.brick) {
            (Some(volume), Some(brick)) => Ok((volume, brick)),
            _ => Err(Error::Internal(format!(
                "remove operation {} was not built",
                self.id
            ))),
        }
    }
}

/// Durability after one replica is gone
fn reduced(durability: Durability) -> Result<Durability> {
    match durability {
        Durability::Replicate { replica } if replica > 2 => Ok(Durability::Replicate {
            replica: replica - 1,
        }),
        Durability::Replicate { replica: 2 } => Ok(Durability::Distribute),
        Durability::Replicate { .. } => Err(Error::Conflict(
            "replica count can't be reduced below 1".into(),
        )),
        other => Err(Error::Conflict(format!(
            "brick removal not allowed for durability {}",
            other
        ))),
    }
}

#[async_trait]
impl Operation for BrickRemoveOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &'static str {
        "Remove Brick"
    }

    fn resource_url(&self) -> Option<String> {
        None
    }

    fn build(&mut self) -> Result<()> {
        let owner = &self.owner;
        let brick_id = &self.brick_id;

        let built = self.db.update(|tx| {
            let mut brick: BrickEntry = tx.get(brick_id)?;
            if !brick.is_materialized() {
                return Ok(None);
            }

            let mut volume: VolumeEntry = tx.get(&brick.volume_id)?;
            reduced(volume.durability)?;
            if volume.brick_sets().len() != 1 {
                return Err(Error::Conflict(format!(
                    "volume {} has more than one brick-set",
                    volume.name
                )));
            }

            owner.claim(&mut volume)?;
            owner.claim(&mut brick)?;
            tx.put(&volume)?;
            tx.put(&brick)?;

            let mut entry = PendingOperationEntry::with_id(&owner.op_id, OperationType::RemoveBrick);
            entry.record_change(ChangeType::DeleteBrick, &brick.id);
            entry.record_change(ChangeType::ModifyVolume, &volume.id);
            tx.put(&entry)?;

            Ok(Some((volume, brick)))
        })?;

        match built {
            Some((volume, brick)) => {
                self.volume = Some(volume);
                self.brick = Some(brick);
            }
            None => {
                warn!("Brick {} has no path, skipping removal", self.brick_id);
                self.skipped = true;
            }
        }
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        let (volume, brick) = self.parts()?;
        let reclaimed = remove_brick(&self.db, executor, volume, brick).await?;
        self.reclaimed = reclaimed;
        Ok(())
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        let (volume, brick) = self.parts()?;
        let owner = &self.owner;

        self.db.update(|tx| {
            if let Some(mut volume) = tx.try_get::<VolumeEntry>(&volume.id)? {
                owner.release(&mut volume);
                tx.put(&volume)?;
            }
            if let Some(mut brick) = tx.try_get::<BrickEntry>(&brick.id)? {
                owner.release(&mut brick);
                tx.put(&brick)?;
            }
            remove_entry(tx, &owner.op_id)
        })
    }

    fn finalize(&mut self) -> Result<()> {
        if self.skipped {
            return Ok(());
        }
        let (volume, brick) = self.parts()?;
        let owner = &self.owner;
        let reclaimed = self.reclaimed;

        let volume = self.db.update(|tx| {
            let mut volume: VolumeEntry = tx.get(&volume.id)?;
            volume.brick_delete(&brick.id);
            volume.durability = reduced(volume.durability)?;
            owner.release(&mut volume);
            tx.put(&volume)?;

            let brick: BrickEntry = tx.get(&brick.id)?;
            if reclaimed {
                BrickAllocator::release(tx, &brick)?;
            } else {
                BrickAllocator::forget(tx, &brick)?;
            }
            remove_entry(tx, &owner.op_id)?;
            Ok(volume)
        })?;

        info!(
            "Volume {} is now {} with {} bricks",
            volume.name,
            volume.durability,
            volume.bricks.len()
        );
        self.volume = Some(volume);
        Ok(())
    }
}
