//! Brick Migration
//!
//! Moves single bricks of running volumes: replacement onto a new device,
//! removal from a replicated set, and evacuation of every brick off a node
//! or device. Evacuation replaces a brick when a new home exists and falls
//! back to dropping one replica otherwise.

pub mod hosts;
pub mod replace;

pub use hosts::*;
pub use replace::*;

use crate::allocation::{BrickAllocator, Exclusions};
use crate::domain::{Durability, Executor};
use crate::error::{Error, Result};
use crate::operations::{
    exec_and_settle, run_operation, BrickRemoveOperation, BrickReplaceOperation, Operation,
};
use crate::store::{BrickEntry, Db, VolumeEntry};
use std::sync::Arc;
use tracing::{info, warn};

/// Move one brick away on behalf of the parent operation `parent_id`
///
/// Runs a child replace operation. When no device can take the brick and
/// the volume is a single replicated set with more than one replica, a
/// child remove operation drops the brick instead.
pub async fn evacuate_brick(
    db: &Arc<Db>,
    allocator: &BrickAllocator,
    executor: &dyn Executor,
    parent_id: &str,
    brick_id: &str,
    exclude: Exclusions,
) -> Result<()> {
    let mut replace =
        BrickReplaceOperation::child(db.clone(), allocator.clone(), parent_id, brick_id, exclude);

    let reason = match replace.build() {
        Ok(()) => return exec_and_settle(db, &mut replace, executor).await,
        Err(Error::NoSpace(reason)) => reason,
        Err(e) => return Err(e),
    };

    let volume = db.view(|tx| {
        let brick: BrickEntry = tx.get(brick_id)?;
        tx.get::<VolumeEntry>(&brick.volume_id)
    })?;

    match volume.durability {
        Durability::Replicate { replica } if replica > 1 && volume.brick_sets().len() == 1 => {
            warn!(
                "No device can take brick {} of volume {}, dropping one replica: {}",
                brick_id, volume.name, reason
            );
            let mut remove = BrickRemoveOperation::child(db.clone(), parent_id, brick_id);
            run_operation(db, &mut remove, executor).await?;
            info!("Brick {} removed from volume {}", brick_id, volume.name);
            Ok(())
        }
        _ => Err(Error::NoSpace(reason)),
    }
}
