//! Node entries

use super::{generate_id, Claimable, DbEntry, EntryState};
use crate::error::{Error, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Hostnames a node is reachable under
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostnames {
    /// Used to run management commands
    pub manage: Vec<String>,
    /// Used in brick addresses
    pub storage: Vec<String>,
}

/// A storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub cluster_id: String,
    pub hostnames: Hostnames,
    /// Failure domain
    pub zone: u32,
    #[serde(default)]
    pub state: EntryState,
    #[serde(default)]
    pub devices: IndexSet<String>,
    #[serde(default)]
    pub pending_id: String,
}

impl DbEntry for NodeEntry {
    const BUCKET: &'static str = "nodes";
    const KIND: &'static str = "node";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Claimable for NodeEntry {
    fn pending_id(&self) -> &str {
        &self.pending_id
    }

    fn pending_id_mut(&mut self) -> &mut String {
        &mut self.pending_id
    }
}

impl NodeEntry {
    pub fn new(cluster_id: impl Into<String>, hostnames: Hostnames, zone: u32) -> Self {
        Self {
            id: generate_id(),
            cluster_id: cluster_id.into(),
            hostnames,
            zone,
            state: EntryState::Online,
            devices: IndexSet::new(),
            pending_id: String::new(),
        }
    }

    pub fn manage_hostname(&self) -> &str {
        self.hostnames
            .manage
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn storage_hostname(&self) -> &str {
        self.hostnames
            .storage
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.state == EntryState::Online
    }

    pub fn device_add(&mut self, id: &str) {
        self.devices.insert(id.to_string());
    }

    pub fn device_delete(&mut self, id: &str) {
        self.devices.shift_remove(id);
    }

    pub fn check_deletable(&self) -> Result<()> {
        if !self.devices.is_empty() {
            return Err(Error::Conflict(format!(
                "node {} still has {} devices",
                self.id,
                self.devices.len()
            )));
        }
        Ok(())
    }

    /// Nodes only move between online and offline; failed is a device state
    pub fn set_state(&mut self, state: EntryState) -> Result<()> {
        if state == EntryState::Failed {
            return Err(Error::Validation("node state must be online or offline".into()));
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hostnames() -> Hostnames {
        Hostnames {
            manage: vec!["mgmt-1".into()],
            storage: vec!["10.0.0.1".into()],
        }
    }

    #[test]
    fn test_node_hostnames() {
        let node = NodeEntry::new("c1", hostnames(), 1);
        assert_eq!(node.manage_hostname(), "mgmt-1");
        assert_eq!(node.storage_hostname(), "10.0.0.1");
        assert!(node.is_online());
    }

    #[test]
    fn test_node_state_rejects_failed() {
        let mut node = NodeEntry::new("c1", hostnames(), 1);
        assert!(node.set_state(EntryState::Offline).is_ok());
        assert!(!node.is_online());
        assert!(node.set_state(EntryState::Failed).is_err());
    }

    #[test]
    fn test_node_delete_blocked_by_devices() {
        let mut node = NodeEntry::new("c1", hostnames(), 1);
        node.device_add("d1");
        assert!(node.check_deletable().is_err());
        node.device_delete("d1");
        assert!(node.check_deletable().is_ok());
    }
}
