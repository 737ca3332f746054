//! Device entries

use super::{generate_id, Claimable, DbEntry, EntryState};
use crate::allocation::DeviceCapacity;
use crate::error::{Error, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// A block device on a node, carved into bricks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub node_id: String,
    /// Device path on the node, e.g. /dev/sdb
    pub name: String,
    #[serde(default)]
    pub weight: u32,
    pub storage: DeviceCapacity,
    #[serde(default)]
    pub bricks: IndexSet<String>,
    #[serde(default)]
    pub state: EntryState,
    #[serde(default)]
    pub pending_id: String,
}

impl DbEntry for DeviceEntry {
    const BUCKET: &'static str = "devices";
    const KIND: &'static str = "device";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Claimable for DeviceEntry {
    fn pending_id(&self) -> &str {
        &self.pending_id
    }

    fn pending_id_mut(&mut self) -> &mut String {
        &mut self.pending_id
    }
}

impl DeviceEntry {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, weight: u32) -> Self {
        Self {
            id: generate_id(),
            node_id: node_id.into(),
            name: name.into(),
            weight,
            storage: DeviceCapacity::default(),
            bricks: IndexSet::new(),
            state: EntryState::Online,
            pending_id: String::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == EntryState::Online
    }

    pub fn storage_set(&mut self, total: u64) {
        self.storage = DeviceCapacity::new(total);
    }

    pub fn storage_check(&self, size: u64) -> bool {
        self.storage.can_allocate(size)
    }

    pub fn storage_allocate(&mut self, size: u64) -> Result<()> {
        self.storage.allocate(size)
    }

    pub fn storage_free(&mut self, size: u64) {
        self.storage.release(size)
    }

    pub fn brick_add(&mut self, id: &str) {
        self.bricks.insert(id.to_string());
    }

    pub fn brick_delete(&mut self, id: &str) {
        self.bricks.shift_remove(id);
    }

    pub fn check_deletable(&self) -> Result<()> {
        if !self.bricks.is_empty() {
            return Err(Error::Conflict(format!(
                "device {} still has {} bricks",
                self.id,
                self.bricks.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_storage_accounting() {
        let mut device = DeviceEntry::new("n1", "/dev/sdb", 100);
        device.storage_set(1000);
        assert!(device.storage_check(1000));

        device.storage_allocate(600).unwrap();
        assert!(!device.storage_check(500));

        device.storage_free(600);
        assert_eq!(device.storage, DeviceCapacity::new(1000));
    }

    #[test]
    fn test_device_delete_blocked_by_bricks() {
        let mut device = DeviceEntry::new("n1", "/dev/sdb", 100);
        device.brick_add("b1");
        assert!(device.check_deletable().is_err());
    }
}
