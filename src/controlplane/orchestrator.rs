//! Main Orchestrator
//!
//! Front door of the daemon. Synchronous administration of clusters, nodes
//! and devices happens here directly; everything that runs storage commands
//! against a volume is built into a pending operation and handed to the
//! task runner.

use crate::allocation::{AllocationLimits, BrickAllocator, DEFAULT_MAX_SNAPSHOT_FACTOR};
use crate::controlplane::tasks::{TaskRunner, TaskRunnerConfig};
use crate::domain::{Durability, ExecutorRef};
use crate::error::{Error, Result};
use crate::executor::CmdExecutorConfig;
use crate::operations::{
    BrickRemoveOperation, BrickReplaceOperation, DeviceRemoveOperation, Operation,
    VolumeCreateOperation, VolumeDeleteOperation, VolumeExpandOperation, VolumeMigrateOperation,
};
use crate::store::{
    is_valid_id, BrickEntry, Claimable, ClusterEntry, Db, DeviceEntry, EntryState,
    Hostnames, NodeEntry, PendingOperationEntry, SnapshotSpec, VolumeEntry,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Which executor the daemon drives storage nodes with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// In-memory simulation, nothing leaves the process
    #[default]
    Mock,
    /// Commands run on this host
    Local,
}

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Brick layout limits
    pub allocation: AllocationLimits,
    /// Largest accepted snapshot factor
    pub max_snapshot_factor: f64,
    /// Operations executing at the same time
    pub workers: usize,
    /// Pause before a retryable operation is attempted again
    pub retry_delay_ms: u64,
    pub executor: ExecutorKind,
    /// Database snapshot file; in-memory when unset
    pub db_path: Option<PathBuf>,
    /// Settings of the command executor
    pub cmdexec: CmdExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            allocation: AllocationLimits::default(),
            max_snapshot_factor: DEFAULT_MAX_SNAPSHOT_FACTOR,
            workers: 8,
            retry_delay_ms: 1000,
            executor: ExecutorKind::default(),
            db_path: None,
            cmdexec: CmdExecutorConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load a YAML configuration file; missing keys keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".into()));
        }
        if self.max_snapshot_factor < 1.0 {
            return Err(Error::Configuration(
                "max_snapshot_factor must be at least 1".into(),
            ));
        }
        let limits = &self.allocation;
        if limits.brick_min_size == 0 || limits.brick_min_size > limits.brick_max_size {
            return Err(Error::Configuration(format!(
                "invalid brick size bounds {}..{} KiB",
                limits.brick_min_size, limits.brick_max_size
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Requests & Responses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddRequest {
    pub cluster: String,
    pub hostnames: Hostnames,
    #[serde(default = "default_zone")]
    pub zone: u32,
}

fn default_zone() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAddRequest {
    pub node: String,
    pub name: String,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCreateRequest {
    /// GiB
    pub size: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub durability: Durability,
    #[serde(default)]
    pub snapshot: SnapshotSpec,
    /// Clusters to try, in order; empty means any
    #[serde(default)]
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeExpandRequest {
    /// GiB to add
    pub expand_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMigrateRequest {
    /// Node to move the volume's bricks off
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub state: EntryState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetails {
    #[serde(flatten)]
    pub node: NodeEntry,
    pub device_entries: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDetails {
    #[serde(flatten)]
    pub device: DeviceEntry,
    pub brick_entries: Vec<BrickEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDetails {
    #[serde(flatten)]
    pub volume: VolumeEntry,
    pub brick_entries: Vec<BrickEntry>,
}

/// Counts reported by the health endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub clusters: usize,
    pub nodes: usize,
    pub devices: usize,
    pub volumes: usize,
    pub pending_operations: usize,
    pub tasks: usize,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates the store, the allocator, the executor and the task runner
pub struct Orchestrator {
    config: OrchestratorConfig,
    db: Arc<Db>,
    executor: ExecutorRef,
    allocator: BrickAllocator,
    tasks: Arc<TaskRunner>,
}

/// Fail with Busy when a pending operation holds the entry
fn ensure_idle<T: Claimable>(entry: &T) -> Result<()> {
    if entry.is_pending() {
        return Err(Error::Busy {
            kind: T::KIND,
            id: entry.id().to_string(),
            owner: entry.pending_id().to_string(),
        });
    }
    Ok(())
}

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if !is_valid_id(id) {
        return Err(Error::Validation(format!("invalid {} id {}", kind, id)));
    }
    Ok(())
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(config: OrchestratorConfig, db: Arc<Db>, executor: ExecutorRef) -> Arc<Self> {
        let tasks = TaskRunner::new(
            db.clone(),
            executor.clone(),
            TaskRunnerConfig {
                workers: config.workers,
                retry_delay: Duration::from_millis(config.retry_delay_ms),
            },
        );
        let allocator = BrickAllocator::new(config.allocation.clone());

        Arc::new(Self {
            config,
            db,
            executor,
            allocator,
            tasks,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn tasks(&self) -> &Arc<TaskRunner> {
        &self.tasks
    }

    /// Report pending operations left behind by an earlier run
    pub fn initialize(&self) -> Result<()> {
        let pending = self.pending_operations()?;
        for entry in &pending {
            warn!(
                "Pending operation {} ({:?}, {:?}) from an earlier run needs reconciliation",
                entry.id, entry.op_type, entry.status
            );
        }
        info!(
            "Orchestrator ready ({} pending operations on record)",
            pending.len()
        );
        Ok(())
    }

    pub fn status(&self) -> Result<OrchestratorStatus> {
        let tasks = self.tasks.list().len();
        self.db.view(|tx| {
            Ok(OrchestratorStatus {
                clusters: tx.ids::<ClusterEntry>().len(),
                nodes: tx.ids::<NodeEntry>().len(),
                devices: tx.ids::<DeviceEntry>().len(),
                volumes: tx.ids::<VolumeEntry>().len(),
                pending_operations: tx.ids::<PendingOperationEntry>().len(),
                tasks,
            })
        })
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    pub fn cluster_create(&self) -> Result<ClusterEntry> {
        let cluster = ClusterEntry::new();
        self.db.update(|tx| tx.put(&cluster))?;
        info!("Created cluster {}", cluster.id);
        Ok(cluster)
    }

    pub fn cluster_list(&self) -> Result<Vec<String>> {
        self.db.view(|tx| Ok(tx.ids::<ClusterEntry>()))
    }

    pub fn cluster_info(&self, id: &str) -> Result<ClusterEntry> {
        self.db.view(|tx| tx.get(id))
    }

    pub fn cluster_delete(&self, id: &str) -> Result<()> {
        self.db.update(|tx| {
            let cluster: ClusterEntry = tx.get(id)?;
            cluster.check_deletable()?;
            tx.delete::<ClusterEntry>(id)
        })?;
        info!("Deleted cluster {}", id);
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn node_add(&self, request: NodeAddRequest) -> Result<NodeEntry> {
        let manage = request
            .hostnames
            .manage
            .first()
            .cloned()
            .ok_or_else(|| Error::Validation("manage hostname missing".into()))?;
        if request.hostnames.storage.is_empty() {
            return Err(Error::Validation("storage hostname missing".into()));
        }

        // Reject early, before talking to the host
        self.db.view(|tx| {
            tx.get::<ClusterEntry>(&request.cluster)?;
            let taken = tx
                .list::<NodeEntry>()?
                .iter()
                .any(|n| n.hostnames.manage.contains(&manage));
            if taken {
                return Err(Error::Conflict(format!("node {} already exists", manage)));
            }
            Ok(())
        })?;

        self.executor.glusterd_check(&manage).await?;

        let node = NodeEntry::new(&request.cluster, request.hostnames, request.zone);
        self.db.update(|tx| {
            let mut cluster: ClusterEntry = tx.get(&node.cluster_id)?;
            if tx
                .list::<NodeEntry>()?
                .iter()
                .any(|n| n.hostnames.manage.contains(&manage))
            {
                return Err(Error::Conflict(format!("node {} already exists", manage)));
            }
            cluster.node_add(&node.id);
            tx.put(&cluster)?;
            tx.put(&node)
        })?;

        info!("Added node {} ({}) to cluster {}", node.id, manage, node.cluster_id);
        Ok(node)
    }

    pub fn node_info(&self, id: &str) -> Result<NodeDetails> {
        self.db.view(|tx| {
            let node: NodeEntry = tx.get(id)?;
            let device_entries = node
                .devices
                .iter()
                .map(|d| tx.get::<DeviceEntry>(d))
                .collect::<Result<Vec<_>>>()?;
            Ok(NodeDetails {
                node,
                device_entries,
            })
        })
    }

    pub fn node_delete(&self, id: &str) -> Result<()> {
        self.db.update(|tx| {
            let node: NodeEntry = tx.get(id)?;
            ensure_idle(&node)?;
            node.check_deletable()?;

            if let Some(mut cluster) = tx.try_get::<ClusterEntry>(&node.cluster_id)? {
                cluster.node_delete(id);
                tx.put(&cluster)?;
            }
            tx.delete::<NodeEntry>(id)
        })?;
        info!("Deleted node {}", id);
        Ok(())
    }

    pub fn node_set_state(&self, id: &str, state: EntryState) -> Result<NodeEntry> {
        let node = self.db.update(|tx| {
            let mut node: NodeEntry = tx.get(id)?;
            ensure_idle(&node)?;
            node.set_state(state)?;
            tx.put(&node)?;
            Ok(node)
        })?;
        info!("Node {} is now {}", id, state);
        Ok(node)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub async fn device_add(&self, request: DeviceAddRequest) -> Result<DeviceEntry> {
        if request.name.is_empty() {
            return Err(Error::Validation("device name missing".into()));
        }

        let node = self.db.view(|tx| {
            let node: NodeEntry = tx.get(&request.node)?;
            for id in &node.devices {
                let device: DeviceEntry = tx.get(id)?;
                if device.name == request.name {
                    return Err(Error::Conflict(format!(
                        "device {} already added to node {}",
                        request.name, node.id
                    )));
                }
            }
            Ok(node)
        })?;
        ensure_idle(&node)?;

        let mut device = DeviceEntry::new(&node.id, &request.name, request.weight);
        let info = self
            .executor
            .device_setup(node.manage_hostname(), &device.name, &device.id)
            .await?;
        device.storage_set(info.size);

        let stored = self.db.update(|tx| {
            let mut node: NodeEntry = tx.get(&request.node)?;
            node.device_add(&device.id);
            tx.put(&node)?;
            tx.put(&device)
        });
        if let Err(e) = stored {
            // Do not leave an orphaned volume group behind
            if let Err(undo) = self
                .executor
                .device_teardown(node.manage_hostname(), &device.name, &device.id)
                .await
            {
                warn!("Unable to tear down device {}: {}", device.name, undo);
            }
            return Err(e);
        }

        info!(
            "Added device {} ({}, {} KiB) to node {}",
            device.id, device.name, device.storage.total, node.id
        );
        Ok(device)
    }

    pub fn device_info(&self, id: &str) -> Result<DeviceDetails> {
        self.db.view(|tx| {
            let device: DeviceEntry = tx.get(id)?;
            let brick_entries = device
                .bricks
                .iter()
                .map(|b| tx.get::<BrickEntry>(b))
                .collect::<Result<Vec<_>>>()?;
            Ok(DeviceDetails {
                device,
                brick_entries,
            })
        })
    }

    /// Delete an empty device that is no longer online
    pub async fn device_delete(&self, id: &str) -> Result<()> {
        let (device, host) = self.db.view(|tx| {
            let device: DeviceEntry = tx.get(id)?;
            ensure_idle(&device)?;
            device.check_deletable()?;
            if device.is_online() {
                return Err(Error::Conflict(format!(
                    "device {} must be offline or failed before it can be deleted",
                    id
                )));
            }
            let node: NodeEntry = tx.get(&device.node_id)?;
            Ok((device, node.manage_hostname().to_string()))
        })?;

        self.executor
            .device_teardown(&host, &device.name, &device.id)
            .await?;

        self.db.update(|tx| {
            // Recheck: a brick may have been placed while the command ran
            let device: DeviceEntry = tx.get(id)?;
            ensure_idle(&device)?;
            device.check_deletable()?;
            if let Some(mut node) = tx.try_get::<NodeEntry>(&device.node_id)? {
                node.device_delete(id);
                tx.put(&node)?;
            }
            tx.delete::<DeviceEntry>(id)
        })?;
        info!("Deleted device {} ({})", id, device.name);
        Ok(())
    }

    /// Move a device between online and offline
    pub fn device_set_state(&self, id: &str, state: EntryState) -> Result<DeviceEntry> {
        if state == EntryState::Failed {
            return Err(Error::Validation(
                "devices are marked failed by removing them".into(),
            ));
        }
        let device = self.db.update(|tx| {
            let mut device: DeviceEntry = tx.get(id)?;
            ensure_idle(&device)?;
            device.state = state;
            tx.put(&device)?;
            Ok(device)
        })?;
        info!("Device {} is now {}", id, state);
        Ok(device)
    }

    /// Evacuate an offline device; returns the task id
    pub fn device_remove(&self, id: &str) -> Result<String> {
        self.submit(DeviceRemoveOperation::new(
            self.db.clone(),
            self.allocator.clone(),
            id,
        ))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Validate and queue a volume creation; returns the task id
    pub fn volume_create(&self, request: VolumeCreateRequest) -> Result<String> {
        if request.size < 1 {
            return Err(Error::Validation("invalid volume size".into()));
        }
        request
            .durability
            .validate(self.config.allocation.max_bricks_per_volume)?;
        if request.snapshot.enable
            && (request.snapshot.factor < 1.0
                || request.snapshot.factor > self.config.max_snapshot_factor)
        {
            return Err(Error::Validation("invalid snapshot factor".into()));
        }
        for id in &request.clusters {
            validate_id("cluster", id)?;
        }

        self.db.view(|tx| {
            if tx.ids::<ClusterEntry>().is_empty() {
                return Err(Error::Validation("no clusters configured".into()));
            }
            for id in &request.clusters {
                if !tx.contains::<ClusterEntry>(id) {
                    return Err(Error::Validation(format!("cluster id {} not found", id)));
                }
            }
            Ok(())
        })?;

        let volume = VolumeEntry::new(
            request.name,
            request.size,
            request.durability,
            request.snapshot,
        );
        info!("Creating volume {} ({} GiB, {})", volume.name, volume.size, volume.durability);
        self.submit(VolumeCreateOperation::new(
            self.db.clone(),
            self.allocator.clone(),
            volume,
            request.clusters,
        ))
    }

    pub fn volume_list(&self) -> Result<Vec<String>> {
        self.db.view(|tx| Ok(tx.ids::<VolumeEntry>()))
    }

    pub fn volume_info(&self, id: &str) -> Result<VolumeDetails> {
        self.db.view(|tx| {
            let volume: VolumeEntry = tx.get(id)?;
            let brick_entries = volume
                .bricks
                .iter()
                .map(|b| tx.get::<BrickEntry>(b))
                .collect::<Result<Vec<_>>>()?;
            Ok(VolumeDetails {
                volume,
                brick_entries,
            })
        })
    }

    pub fn volume_delete(&self, id: &str) -> Result<String> {
        self.submit(VolumeDeleteOperation::new(self.db.clone(), id))
    }

    pub fn volume_expand(&self, id: &str, request: VolumeExpandRequest) -> Result<String> {
        if request.expand_size < 1 {
            return Err(Error::Validation("invalid volume expansion size".into()));
        }
        self.submit(VolumeExpandOperation::new(
            self.db.clone(),
            self.allocator.clone(),
            id,
            request.expand_size,
        ))
    }

    pub fn volume_migrate(&self, id: &str, request: VolumeMigrateRequest) -> Result<String> {
        validate_id("node", &request.node)?;
        self.submit(VolumeMigrateOperation::new(
            self.db.clone(),
            self.allocator.clone(),
            id,
            request.node,
        ))
    }

    // =========================================================================
    // Bricks
    // =========================================================================

    pub fn brick_replace(&self, id: &str) -> Result<String> {
        self.submit(BrickReplaceOperation::new(
            self.db.clone(),
            self.allocator.clone(),
            id,
        ))
    }

    pub fn brick_remove(&self, id: &str) -> Result<String> {
        self.submit(BrickRemoveOperation::new(self.db.clone(), id))
    }

    // =========================================================================
    // Pending Operations
    // =========================================================================

    pub fn pending_operations(&self) -> Result<Vec<PendingOperationEntry>> {
        let mut entries = self.db.view(|tx| tx.list::<PendingOperationEntry>())?;
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    fn submit(&self, op: impl Operation + 'static) -> Result<String> {
        self.tasks.submit(Box::new(op))
    }
}
