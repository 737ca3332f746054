//! Volume entries

use super::{generate_id, Claimable, DbEntry};
use crate::domain::{Durability, GB};
use serde::{Deserialize, Serialize};

/// Snapshot settings of a volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    #[serde(default)]
    pub enable: bool,
    /// Thin pool size as a multiple of the brick size
    #[serde(default = "default_snapshot_factor")]
    pub factor: f64,
}

fn default_snapshot_factor() -> f64 {
    1.0
}

impl Default for SnapshotSpec {
    fn default() -> Self {
        Self {
            enable: false,
            factor: default_snapshot_factor(),
        }
    }
}

/// A volume assembled from brick-sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub id: String,
    pub name: String,
    /// Requested size in GiB
    pub size: u64,
    pub durability: Durability,
    #[serde(default)]
    pub snapshot: SnapshotSpec,
    #[serde(default)]
    pub cluster_id: String,
    /// Bricks in brick-set order; consecutive runs of
    /// `durability.bricks_in_set()` ids form one set
    #[serde(default)]
    pub bricks: Vec<String>,
    #[serde(default)]
    pub pending_id: String,
}

impl DbEntry for VolumeEntry {
    const BUCKET: &'static str = "volumes";
    const KIND: &'static str = "volume";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Claimable for VolumeEntry {
    fn pending_id(&self) -> &str {
        &self.pending_id
    }

    fn pending_id_mut(&mut self) -> &mut String {
        &mut self.pending_id
    }
}

impl VolumeEntry {
    pub fn new(
        name: Option<String>,
        size: u64,
        durability: Durability,
        snapshot: SnapshotSpec,
    ) -> Self {
        let id = generate_id();
        let name = name.unwrap_or_else(|| format!("vol_{}", id));
        Self {
            id,
            name,
            size,
            durability,
            snapshot,
            cluster_id: String::new(),
            bricks: Vec::new(),
            pending_id: String::new(),
        }
    }

    /// Requested size in KiB
    pub fn size_kib(&self) -> u64 {
        self.size.saturating_mul(GB)
    }

    /// Snapshot factor applied to new bricks, `None` when snapshots are off
    pub fn snapshot_factor(&self) -> Option<f64> {
        self.snapshot.enable.then_some(self.snapshot.factor)
    }

    pub fn brick_sets(&self) -> Vec<&[String]> {
        self.bricks
            .chunks(self.durability.bricks_in_set().max(1))
            .collect()
    }

    /// The brick-set containing `brick_id`
    pub fn brick_set_of(&self, brick_id: &str) -> Option<&[String]> {
        let width = self.durability.bricks_in_set().max(1);
        let pos = self.bricks.iter().position(|b| b == brick_id)?;
        let start = pos / width * width;
        let end = (start + width).min(self.bricks.len());
        Some(&self.bricks[start..end])
    }

    pub fn brick_add(&mut self, id: &str) {
        if !self.bricks.iter().any(|b| b == id) {
            self.bricks.push(id.to_string());
        }
    }

    /// Swap a brick in place, keeping its position in the set
    pub fn brick_replace(&mut self, old: &str, new: &str) -> bool {
        match self.bricks.iter_mut().find(|b| *b == old) {
            Some(slot) => {
                *slot = new.to_string();
                true
            }
            None => false,
        }
    }

    pub fn brick_delete(&mut self, id: &str) {
        self.bricks.retain(|b| b != id);
    }
}
