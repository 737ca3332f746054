//! In-memory executor
//!
//! Simulates storage nodes for tests and standalone runs: keeps the brick
//! membership of every running volume, lets tests take hosts down, set heal
//! backlogs per brick and inject failures per call.

use crate::domain::{
    BrickHealStatus, BrickInfo, BrickRequest, DeviceInfo, Executor, HealInfo, VolumeInfo,
    VolumeRequest, GB,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Default size reported for newly set up devices: 1 TiB
pub const MOCK_DEVICE_SIZE: u64 = 1024 * GB;

/// Executor calls that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    GlusterdCheck,
    DeviceSetup,
    DeviceTeardown,
    BrickCreate,
    BrickDestroy,
    VolumeCreate,
    VolumeDestroy,
    VolumeAddBrick,
    VolumeRemoveBrick,
    VolumeReplaceBrick,
    VolumeInfo,
    HealInfo,
}

#[derive(Debug)]
struct MockState {
    volumes: HashMap<String, Vec<BrickInfo>>,
    down_hosts: HashSet<String>,
    heal: HashMap<BrickInfo, Option<u64>>,
    /// Remaining injected failures per call
    failures: HashMap<MockCall, usize>,
    calls: HashMap<MockCall, usize>,
    device_size: u64,
    reclaim_space: bool,
}

/// Fake executor backed by in-memory state
#[derive(Debug)]
pub struct MockExecutor {
    state: Mutex<MockState>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Self::with_device_size(MOCK_DEVICE_SIZE)
    }

    /// Report `size` KiB for every device set up
    pub fn with_device_size(size: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                volumes: HashMap::new(),
                down_hosts: HashSet::new(),
                heal: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                device_size: size,
                reclaim_space: true,
            }),
        })
    }

    pub fn set_host_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.down_hosts.remove(host);
        } else {
            state.down_hosts.insert(host.to_string());
        }
    }

    /// Pending heal entries for a brick; `None` reports the brick as down
    pub fn set_heal_entries(&self, brick: BrickInfo, entries: Option<u64>) {
        self.state.lock().heal.insert(brick, entries);
    }

    /// Whether brick_destroy reports reclaimed space
    pub fn set_reclaim_space(&self, reclaim: bool) {
        self.state.lock().reclaim_space = reclaim;
    }

    /// Fail every subsequent `call`
    pub fn fail_on(&self, call: MockCall) {
        self.state.lock().failures.insert(call, usize::MAX);
    }

    /// Fail the next `call` only
    pub fn fail_once(&self, call: MockCall) {
        self.state.lock().failures.insert(call, 1);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// How many times `call` was made
    pub fn calls(&self, call: MockCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Bricks of a running volume
    pub fn volume_bricks(&self, name: &str) -> Option<Vec<BrickInfo>> {
        self.state.lock().volumes.get(name).cloned()
    }

    /// Count the call and decide whether it fails
    fn enter(&self, call: MockCall, host: &str) -> Result<parking_lot::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock();
        *state.calls.entry(call).or_insert(0) += 1;
        debug!("Mock {:?} on {}", call, host);

        if state.down_hosts.contains(host) {
            return Err(Error::executor(host, "host unreachable"));
        }

        if let Some(remaining) = state.failures.get_mut(&call) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(Error::executor(host, format!("injected {:?} failure", call)));
            }
        }

        Ok(state)
    }

    fn brick_path(brick: &BrickRequest) -> String {
        format!(
            "/var/lib/brickd/mounts/vg_{}/brick_{}/brick",
            brick.vg_id, brick.id
        )
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn glusterd_check(&self, host: &str) -> Result<()> {
        self.enter(MockCall::GlusterdCheck, host)?;
        Ok(())
    }

    async fn device_setup(&self, host: &str, _device: &str, _vg_id: &str) -> Result<DeviceInfo> {
        let state = self.enter(MockCall::DeviceSetup, host)?;
        Ok(DeviceInfo {
            size: state.device_size,
        })
    }

    async fn device_teardown(&self, host: &str, _device: &str, _vg_id: &str) -> Result<()> {
        self.enter(MockCall::DeviceTeardown, host)?;
        Ok(())
    }

    async fn brick_create(&self, host: &str, brick: &BrickRequest) -> Result<BrickInfo> {
        self.enter(MockCall::BrickCreate, host)?;
        Ok(BrickInfo::new(host, Self::brick_path(brick)))
    }

    async fn brick_destroy(&self, host: &str, _brick: &BrickRequest) -> Result<bool> {
        let state = self.enter(MockCall::BrickDestroy, host)?;
        Ok(state.reclaim_space)
    }

    async fn volume_create(&self, host: &str, volume: &VolumeRequest) -> Result<VolumeInfo> {
        let mut state = self.enter(MockCall::VolumeCreate, host)?;
        if state.volumes.contains_key(&volume.name) {
            return Err(Error::executor(
                host,
                format!("volume {} already exists", volume.name),
            ));
        }
        state
            .volumes
            .insert(volume.name.clone(), volume.bricks.clone());
        Ok(VolumeInfo {
            name: volume.name.clone(),
            bricks: volume.bricks.clone(),
        })
    }

    async fn volume_destroy(&self, host: &str, volume: &str) -> Result<()> {
        let mut state = self.enter(MockCall::VolumeDestroy, host)?;
        state
            .volumes
            .remove(volume)
            .map(|_| ())
            .ok_or_else(|| Error::executor(host, format!("volume {} does not exist", volume)))
    }

    async fn volume_add_brick(
        &self,
        host: &str,
        volume: &str,
        bricks: &[BrickInfo],
        _replica: Option<usize>,
    ) -> Result<()> {
        let mut state = self.enter(MockCall::VolumeAddBrick, host)?;
        let members = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| Error::executor(host, format!("volume {} does not exist", volume)))?;
        members.extend(bricks.iter().cloned());
        Ok(())
    }

    async fn volume_remove_brick(
        &self,
        host: &str,
        volume: &str,
        brick: &BrickInfo,
        _replica: Option<usize>,
    ) -> Result<()> {
        let mut state = self.enter(MockCall::VolumeRemoveBrick, host)?;
        let members = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| Error::executor(host, format!("volume {} does not exist", volume)))?;
        let before = members.len();
        members.retain(|b| b != brick);
        if members.len() == before {
            return Err(Error::executor(
                host,
                format!("brick {} is not part of volume {}", brick, volume),
            ));
        }
        Ok(())
    }

    async fn volume_replace_brick(
        &self,
        host: &str,
        volume: &str,
        old: &BrickInfo,
        new: &BrickInfo,
    ) -> Result<()> {
        let mut state = self.enter(MockCall::VolumeReplaceBrick, host)?;
        let members = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| Error::executor(host, format!("volume {} does not exist", volume)))?;
        let slot = members
            .iter_mut()
            .find(|b| *b == old)
            .ok_or_else(|| {
                Error::executor(host, format!("brick {} is not part of volume {}", old, volume))
            })?;
        *slot = new.clone();
        Ok(())
    }

    async fn volume_info(&self, host: &str, volume: &str) -> Result<VolumeInfo> {
        let state = self.enter(MockCall::VolumeInfo, host)?;
        let bricks = state
            .volumes
            .get(volume)
            .cloned()
            .ok_or_else(|| Error::executor(host, format!("volume {} does not exist", volume)))?;
        Ok(VolumeInfo {
            name: volume.to_string(),
            bricks,
        })
    }

    async fn heal_info(&self, host: &str, volume: &str) -> Result<HealInfo> {
        let state = self.enter(MockCall::HealInfo, host)?;
        let members = state
            .volumes
            .get(volume)
            .ok_or_else(|| Error::executor(host, format!("volume {} does not exist", volume)))?;
        let bricks = members
            .iter()
            .map(|brick| BrickHealStatus {
                brick: brick.clone(),
                entries: state.heal.get(brick).copied().unwrap_or(Some(0)),
            })
            .collect();
        Ok(HealInfo { bricks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Durability;
    use assert_matches::assert_matches;

    fn request(id: &str) -> BrickRequest {
        BrickRequest {
            id: id.into(),
            vg_id: "vg1".into(),
            size: 100,
            tp_size: 100,
            pool_metadata_size: 1,
            path: String::new(),
        }
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let exec = MockExecutor::new();
        let a = exec.brick_create("h1", &request("a")).await.unwrap();
        let b = exec.brick_create("h2", &request("b")).await.unwrap();

        exec.volume_create(
            "h1",
            &VolumeRequest {
                name: "vol".into(),
                durability: Durability::Replicate { replica: 2 },
                bricks: vec![a.clone(), b.clone()],
            },
        )
        .await
        .unwrap();

        let c = BrickInfo::new("h3", "/c");
        exec.volume_replace_brick("h1", "vol", &b, &c).await.unwrap();
        let info = exec.volume_info("h1", "vol").await.unwrap();
        assert_eq!(info.bricks, vec![a, c]);

        exec.volume_destroy("h1", "vol").await.unwrap();
        assert!(exec.volume_bricks("vol").is_none());
        assert_eq!(exec.calls(MockCall::BrickCreate), 2);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let exec = MockExecutor::new();
        exec.set_host_reachable("h1", false);
        assert_matches!(
            exec.glusterd_check("h1").await,
            Err(Error::Executor { .. })
        );

        exec.set_host_reachable("h1", true);
        assert!(exec.glusterd_check("h1").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let exec = MockExecutor::new();
        exec.fail_once(MockCall::BrickCreate);
        assert!(exec.brick_create("h1", &request("a")).await.is_err());
        assert!(exec.brick_create("h1", &request("a")).await.is_ok());

        exec.fail_on(MockCall::BrickDestroy);
        assert!(exec.brick_destroy("h1", &request("a")).await.is_err());
        assert!(exec.brick_destroy("h1", &request("a")).await.is_err());
        exec.clear_failures();
        assert!(exec.brick_destroy("h1", &request("a")).await.unwrap());
    }
}
