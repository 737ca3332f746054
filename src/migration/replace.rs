//! Brick replacement and removal on a running volume

use super::hosts::command_host;
use crate::domain::{BrickInfo, Durability, Executor};
use crate::error::{Error, Result};
use crate::operations::bricks::{brick_info, create_bricks, destroy_brick};
use crate::operations::past_point_of_no_return;
use crate::store::{BrickEntry, Db, VolumeEntry};
use tracing::info;

const REPLACE_LABEL: &str = "Replace Brick";

/// Swap `old` for `new` in a running volume
///
/// `new` must be reserved but not yet created; its path is set once the
/// brick exists. Returns whether the space of the old brick was reclaimed.
/// Once the volume runs on the new brick nothing is undone: later failures
/// are [`Error::Unrecoverable`]. A failed replace-brick command itself
/// leaves the volume on the old brick.
pub async fn replace_brick(
    db: &Db,
    executor: &dyn Executor,
    volume: &VolumeEntry,
    old: &BrickEntry,
    new: &mut BrickEntry,
) -> Result<bool> {
    let host = command_host(db, executor, Some(old.node_id.as_str()), &volume.cluster_id).await?;
    let old_info = brick_info(db, old)?;

    let running = executor.volume_info(&host, &volume.name).await?;
    if !running.contains(&old_info) {
        return Err(Error::Conflict(format!(
            "brick {} is not part of running volume {}",
            old_info, volume.name
        )));
    }

    if volume.durability != Durability::Distribute {
        check_heal_sources(db, executor, &host, volume, old).await?;
    }

    create_bricks(db, executor, std::slice::from_mut(new)).await?;
    let new_info = brick_info(db, new)?;

    match volume.durability {
        Durability::Distribute => {
            executor
                .volume_add_brick(&host, &volume.name, std::slice::from_ref(&new_info), None)
                .await?;
            executor
                .volume_remove_brick(&host, &volume.name, &old_info, None)
                .await
                .map_err(|e| past_point_of_no_return(REPLACE_LABEL, e))?;
        }
        _ => {
            executor
                .volume_replace_brick(&host, &volume.name, &old_info, &new_info)
                .await?;
        }
    }

    info!(
        "Replaced brick {} with {} in volume {}",
        old_info, new_info, volume.name
    );
    Ok(destroy_brick(db, executor, old).await)
}

/// Refuse to replace a brick that holds the only good copy of some data
///
/// Sources are the bricks of the set with pending heal entries. Bricks that
/// are down report no entries and are never sources.
async fn check_heal_sources(
    db: &Db,
    executor: &dyn Executor,
    host: &str,
    volume: &VolumeEntry,
    old: &BrickEntry,
) -> Result<()> {
    let heal = executor.heal_info(host, &volume.name).await?;

    let set = volume.brick_set_of(&old.id).unwrap_or_default();
    let mut sources = Vec::new();
    for id in set {
        let brick: BrickEntry = db.view(|tx| tx.get(id))?;
        let info = brick_info(db, &brick)?;
        if matches!(heal.entries_for(&info), Some(n) if n > 0) {
            sources.push(brick.id);
        }
    }

    if sources.len() == 1 && sources[0] == old.id {
        return Err(Error::Conflict(format!(
            "brick {} is the only heal source of its brick-set in volume {}",
            old.id, volume.name
        )));
    }
    Ok(())
}

/// Drop `brick` from a replicated volume, reducing the replica count by one
///
/// Returns whether the brick's space was reclaimed.
pub async fn remove_brick(
    db: &Db,
    executor: &dyn Executor,
    volume: &VolumeEntry,
    brick: &BrickEntry,
) -> Result<bool> {
    let replica = volume.durability.replica().ok_or_else(|| {
        Error::Conflict(format!(
            "brick removal not allowed for durability {}",
            volume.durability
        ))
    })?;

    let host = command_host(db, executor, Some(brick.node_id.as_str()), &volume.cluster_id).await?;
    let info: BrickInfo = brick_info(db, brick)?;

    executor
        .volume_remove_brick(&host, &volume.name, &info, Some(replica - 1))
        .await?;
    info!(
        "Removed brick {} from volume {}, replica {} -> {}",
        info,
        volume.name,
        replica,
        replica - 1
    );

    Ok(destroy_brick(db, executor, brick).await)
}
