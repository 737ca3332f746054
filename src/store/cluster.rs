//! Cluster entries

use super::{generate_id, DbEntry};
use crate::error::{Error, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// A cluster: the root of a node and volume hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,
    /// Member nodes in insertion order
    #[serde(default)]
    pub nodes: IndexSet<String>,
    /// Volumes placed on this cluster
    #[serde(default)]
    pub volumes: IndexSet<String>,
}

impl DbEntry for ClusterEntry {
    const BUCKET: &'static str = "clusters";
    const KIND: &'static str = "cluster";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Default for ClusterEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterEntry {
    pub fn new() -> Self {
        Self {
            id: generate_id(),
            nodes: IndexSet::new(),
            volumes: IndexSet::new(),
        }
    }

    pub fn node_add(&mut self, id: &str) {
        self.nodes.insert(id.to_string());
    }

    pub fn node_delete(&mut self, id: &str) {
        self.nodes.shift_remove(id);
    }

    pub fn volume_add(&mut self, id: &str) {
        self.volumes.insert(id.to_string());
    }

    pub fn volume_delete(&mut self, id: &str) {
        self.volumes.shift_remove(id);
    }

    /// A cluster can only be deleted once it owns nothing
    pub fn check_deletable(&self) -> Result<()> {
        if !self.nodes.is_empty() || !self.volumes.is_empty() {
            return Err(Error::Conflict(format!(
                "cluster {} still has {} nodes and {} volumes",
                self.id,
                self.nodes.len(),
                self.volumes.len()
            )));
        }
        Ok(())
    }
}
