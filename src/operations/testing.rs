//! Fixtures for operation tests

use super::{run_operation, VolumeCreateOperation};
use crate::allocation::BrickAllocator;
use crate::domain::{Durability, Executor};
use crate::store::{
    BrickEntry, ClusterEntry, Db, DeviceEntry, Hostnames, NodeEntry, PendingOperationEntry,
    SnapshotSpec, VolumeEntry,
};
use std::sync::Arc;

/// One cluster with `nodes` nodes, each in its own zone, holding `devices`
/// devices of `device_size` KiB
pub fn cluster(nodes: usize, devices: usize, device_size: u64) -> (Arc<Db>, String) {
    let db = Db::in_memory();
    let cluster_id = db
        .update(|tx| {
            let mut cluster = ClusterEntry::new();
            for n in 0..nodes {
                let mut node = NodeEntry::new(
                    &cluster.id,
                    Hostnames {
                        manage: vec![format!("node{}", n)],
                        storage: vec![format!("10.0.0.{}", n)],
                    },
                    n as u32 + 1,
                );
                for d in 0..devices {
                    let mut device = DeviceEntry::new(&node.id, format!("/dev/sd{}", d), 0);
                    device.storage_set(device_size);
                    node.device_add(&device.id);
                    tx.put(&device)?;
                }
                cluster.node_add(&node.id);
                tx.put(&node)?;
            }
            tx.put(&cluster)?;
            Ok(cluster.id)
        })
        .unwrap();
    (db, cluster_id)
}

pub async fn create_volume(
    db: &Arc<Db>,
    executor: &dyn Executor,
    size: u64,
    durability: Durability,
) -> VolumeEntry {
    let volume = VolumeEntry::new(None, size, durability, SnapshotSpec::default());
    let mut op = VolumeCreateOperation::new(db.clone(), BrickAllocator::default(), volume, vec![]);
    run_operation(db, &mut op, executor).await.unwrap();
    op.volume().clone()
}

pub fn pending_count(db: &Db) -> usize {
    db.view(|tx| Ok(tx.ids::<PendingOperationEntry>().len())).unwrap()
}

pub fn volume(db: &Db, id: &str) -> VolumeEntry {
    db.view(|tx| tx.get(id)).unwrap()
}

pub fn brick(db: &Db, id: &str) -> BrickEntry {
    db.view(|tx| tx.get(id)).unwrap()
}

/// Node ids of the cluster, in insertion order
pub fn nodes(db: &Db, cluster_id: &str) -> Vec<String> {
    db.view(|tx| tx.get::<ClusterEntry>(cluster_id))
        .unwrap()
        .nodes
        .into_iter()
        .collect()
}
