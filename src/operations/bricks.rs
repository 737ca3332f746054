//! Brick helpers shared by operations

use crate::domain::{BrickInfo, Executor};
use crate::error::{Error, Result};
use crate::store::{BrickEntry, Db, NodeEntry};
use futures::future::join_all;
use tracing::{error, warn};

/// Manage and storage hostnames of a node
pub fn node_hosts(db: &Db, node_id: &str) -> Result<(String, String)> {
    db.view(|tx| {
        let node: NodeEntry = tx.get(node_id)?;
        Ok((
            node.manage_hostname().to_string(),
            node.storage_hostname().to_string(),
        ))
    })
}

/// Address of a materialized brick as the volume sees it
pub fn brick_info(db: &Db, brick: &BrickEntry) -> Result<BrickInfo> {
    let (_, storage) = node_hosts(db, &brick.node_id)?;
    Ok(BrickInfo::new(storage, brick.path.clone()))
}

pub fn brick_infos(db: &Db, bricks: &[BrickEntry]) -> Result<Vec<BrickInfo>> {
    bricks.iter().map(|b| brick_info(db, b)).collect()
}

/// Create bricks on their nodes concurrently
///
/// Every brick that was created gets its path set, even when others
/// failed, so that a rollback can find and destroy it. Returns the first
/// failure.
pub async fn create_bricks(
    db: &Db,
    executor: &dyn Executor,
    bricks: &mut [BrickEntry],
) -> Result<()> {
    let hosts = bricks
        .iter()
        .map(|b| node_hosts(db, &b.node_id).map(|(manage, _)| manage))
        .collect::<Result<Vec<_>>>()?;
    let requests: Vec<_> = bricks.iter().map(BrickEntry::request).collect();

    let results = join_all(
        hosts
            .iter()
            .zip(requests.iter())
            .map(|(host, request)| executor.brick_create(host, request)),
    )
    .await;

    let mut first_error: Option<Error> = None;
    for (brick, result) in bricks.iter_mut().zip(results) {
        match result {
            Ok(info) => brick.path = info.path,
            Err(e) => {
                error!("Unable to create brick {}: {}", brick.id, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Destroy one brick; returns whether its space was reclaimed
///
/// Failures are logged, never returned. A brick that was never created
/// counts as reclaimed.
pub async fn destroy_brick(db: &Db, executor: &dyn Executor, brick: &BrickEntry) -> bool {
    if !brick.is_materialized() {
        return true;
    }

    let host = match node_hosts(db, &brick.node_id) {
        Ok((manage, _)) => manage,
        Err(e) => {
            warn!("Unable to locate node of brick {}: {}", brick.id, e);
            return false;
        }
    };

    match executor.brick_destroy(&host, &brick.request()).await {
        Ok(reclaimed) => {
            if !reclaimed {
                warn!("Space of brick {} on {} was not reclaimed", brick.id, host);
            }
            reclaimed
        }
        Err(e) => {
            warn!("Unable to destroy brick {} on {}: {}", brick.id, host, e);
            false
        }
    }
}

/// Destroy bricks concurrently; one reclaimed flag per brick
pub async fn destroy_bricks(db: &Db, executor: &dyn Executor, bricks: &[BrickEntry]) -> Vec<bool> {
    join_all(bricks.iter().map(|b| destroy_brick(db, executor, b))).await
}
