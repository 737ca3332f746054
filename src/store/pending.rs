//! Pending Operation Entries
//!
//! A pending operation entry records an in-flight infrastructure change and
//! the entities it touches. The numeric operation and change codes below are
//! persisted and form a versioned on-disk schema; never renumber them.

use super::{generate_id, DbEntry};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of the code tables below
pub const PENDING_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Codes
// =============================================================================

/// What kind of operation an entry represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum OperationType {
    Unknown = 0,
    CreateVolume = 1,
    DeleteVolume = 2,
    ExpandVolume = 3,
    MigrateVolume = 4,
    ReplaceBrick = 5,
    RemoveBrick = 6,
    RemoveDevice = 7,
}

impl TryFrom<u8> for OperationType {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match code {
            0 => OperationType::Unknown,
            1 => OperationType::CreateVolume,
            2 => OperationType::DeleteVolume,
            3 => OperationType::ExpandVolume,
            4 => OperationType::MigrateVolume,
            5 => OperationType::ReplaceBrick,
            6 => OperationType::RemoveBrick,
            7 => OperationType::RemoveDevice,
            other => return Err(format!("unknown operation type code {}", other)),
        })
    }
}

impl From<OperationType> for u8 {
    fn from(t: OperationType) -> u8 {
        t as u8
    }
}

/// What happened to one entity referenced by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ChangeType {
    Unknown = 0,
    AddBrick = 1,
    AddVolume = 2,
    DeleteBrick = 3,
    DeleteVolume = 4,
    ExpandVolume = 5,
    MigrateVolume = 6,
    ModifyVolume = 7,
    RemoveDevice = 8,
}

impl TryFrom<u8> for ChangeType {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match code {
            0 => ChangeType::Unknown,
            1 => ChangeType::AddBrick,
            2 => ChangeType::AddVolume,
            3 => ChangeType::DeleteBrick,
            4 => ChangeType::DeleteVolume,
            5 => ChangeType::ExpandVolume,
            6 => ChangeType::MigrateVolume,
            7 => ChangeType::ModifyVolume,
            8 => ChangeType::RemoveDevice,
            other => return Err(format!("unknown change type code {}", other)),
        })
    }
}

impl From<ChangeType> for u8 {
    fn from(t: ChangeType) -> u8 {
        t as u8
    }
}

// =============================================================================
// Entry
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    #[default]
    Active,
    /// Exec failed past the point of no return; needs manual reconciliation
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub change: ChangeType,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperationEntry {
    pub id: String,
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: PendingStatus,
    #[serde(default)]
    pub changes: Vec<PendingChange>,
}

impl DbEntry for PendingOperationEntry {
    const BUCKET: &'static str = "pendingops";
    const KIND: &'static str = "pending operation";

    fn id(&self) -> &str {
        &self.id
    }
}

impl PendingOperationEntry {
    pub fn new(op_type: OperationType) -> Self {
        Self::with_id(generate_id(), op_type)
    }

    pub fn with_id(id: impl Into<String>, op_type: OperationType) -> Self {
        Self {
            id: id.into(),
            schema_version: PENDING_SCHEMA_VERSION,
            op_type,
            timestamp: Utc::now(),
            status: PendingStatus::Active,
            changes: Vec::new(),
        }
    }

    pub fn record_change(&mut self, change: ChangeType, id: &str) {
        self.changes.push(PendingChange {
            change,
            id: id.to_string(),
        });
    }

    pub fn references(&self, id: &str) -> bool {
        self.changes.iter().any(|c| c.id == id)
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// An entity that can be reserved by a pending operation
pub trait Claimable: DbEntry {
    fn pending_id(&self) -> &str;
    fn pending_id_mut(&mut self) -> &mut String;

    fn is_pending(&self) -> bool {
        !self.pending_id().is_empty()
    }
}

/// Identity an operation claims entities under
///
/// A child operation also accepts entities already claimed by its parent,
/// without re-marking them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub op_id: String,
    pub parent: Option<String>,
}

impl Owner {
    pub fn new(op_id: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            parent: None,
        }
    }

    pub fn child(op_id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            parent: Some(parent.into()),
        }
    }

    fn owns(&self, pending_id: &str) -> bool {
        pending_id == self.op_id || self.parent.as_deref() == Some(pending_id)
    }

    /// Fail with Busy if another operation holds the entity
    pub fn check<T: Claimable>(&self, entry: &T) -> Result<()> {
        let pending = entry.pending_id();
        if pending.is_empty() || self.owns(pending) {
            return Ok(());
        }
        Err(Error::Busy {
            kind: T::KIND,
            id: entry.id().to_string(),
            owner: pending.to_string(),
        })
    }

    /// Mark the entity as held by this operation
    pub fn claim<T: Claimable>(&self, entry: &mut T) -> Result<()> {
        self.check(entry)?;
        if !entry.is_pending() {
            *entry.pending_id_mut() = self.op_id.clone();
        }
        Ok(())
    }

    /// Clear the mark if this operation set it
    pub fn release<T: Claimable>(&self, entry: &mut T) {
        if entry.pending_id() == self.op_id {
            entry.pending_id_mut().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Durability;
    use crate::store::{SnapshotSpec, VolumeEntry};
    use assert_matches::assert_matches;

    fn volume() -> VolumeEntry {
        VolumeEntry::new(None, 10, Durability::Distribute, SnapshotSpec::default())
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(u8::from(OperationType::CreateVolume), 1);
        assert_eq!(u8::from(OperationType::RemoveDevice), 7);
        assert_eq!(u8::from(ChangeType::MigrateVolume), 6);
        assert_eq!(OperationType::try_from(4u8).unwrap(), OperationType::MigrateVolume);
        assert!(ChangeType::try_from(42u8).is_err());
    }

    #[test]
    fn test_entry_serializes_codes_as_integers() {
        let mut entry = PendingOperationEntry::new(OperationType::ReplaceBrick);
        entry.record_change(ChangeType::AddBrick, "b1");

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], 5);
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["changes"][0]["change"], 1);

        let back: PendingOperationEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
        assert!(back.references("b1"));
    }

    #[test]
    fn test_claim_and_release() {
        let mut vol = volume();
        let a = Owner::new("op-a");
        let b = Owner::new("op-b");

        a.claim(&mut vol).unwrap();
        assert_eq!(vol.pending_id, "op-a");
        assert_matches!(b.claim(&mut vol), Err(Error::Busy { kind: "volume", .. }));

        b.release(&mut vol);
        assert_eq!(vol.pending_id, "op-a");
        a.release(&mut vol);
        assert!(!vol.is_pending());
    }

    #[test]
    fn test_child_accepts_parent_claim() {
        let mut vol = volume();
        Owner::new("parent").claim(&mut vol).unwrap();

        let child = Owner::child("child", "parent");
        child.claim(&mut vol).unwrap();
        assert_eq!(vol.pending_id, "parent");

        child.release(&mut vol);
        assert_eq!(vol.pending_id, "parent");
    }
}
