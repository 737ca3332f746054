//! Brick entries

use super::{generate_id, Claimable, DbEntry};
use crate::allocation::BrickSize;
use crate::domain::BrickRequest;
use serde::{Deserialize, Serialize};

/// A brick: one slice of one device, serving one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickEntry {
    pub id: String,
    pub device_id: String,
    pub node_id: String,
    pub volume_id: String,
    /// Mounted path; empty until the brick has been created on its node
    #[serde(default)]
    pub path: String,
    /// Sizes in KiB
    pub size: u64,
    pub tp_size: u64,
    pub pool_metadata_size: u64,
    #[serde(default)]
    pub pending_id: String,
}

impl DbEntry for BrickEntry {
    const BUCKET: &'static str = "bricks";
    const KIND: &'static str = "brick";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Claimable for BrickEntry {
    fn pending_id(&self) -> &str {
        &self.pending_id
    }

    fn pending_id_mut(&mut self) -> &mut String {
        &mut self.pending_id
    }
}

impl BrickEntry {
    pub fn new(
        sizing: BrickSize,
        device_id: impl Into<String>,
        node_id: impl Into<String>,
        volume_id: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            device_id: device_id.into(),
            node_id: node_id.into(),
            volume_id: volume_id.into(),
            path: String::new(),
            size: sizing.size,
            tp_size: sizing.tp_size,
            pool_metadata_size: sizing.pool_metadata_size,
            pending_id: String::new(),
        }
    }

    pub fn sizing(&self) -> BrickSize {
        BrickSize {
            size: self.size,
            tp_size: self.tp_size,
            pool_metadata_size: self.pool_metadata_size,
        }
    }

    /// Space this brick holds on its device
    pub fn total_size(&self) -> u64 {
        self.sizing().total()
    }

    pub fn is_materialized(&self) -> bool {
        !self.path.is_empty()
    }

    /// Executor request describing this brick
    pub fn request(&self) -> BrickRequest {
        BrickRequest {
            id: self.id.clone(),
            vg_id: self.device_id.clone(),
            size: self.size,
            tp_size: self.tp_size,
            pool_metadata_size: self.pool_metadata_size,
            path: self.path.clone(),
        }
    }
}
