//! Command executor
//!
//! Implements the executor port by composing LVM, XFS and gluster CLI
//! commands and handing them to a [`CommandTransport`].

use crate::domain::{
    BrickHealStatus, BrickInfo, BrickRequest, DeviceInfo, Durability, Executor, HealInfo,
    VolumeInfo, VolumeRequest,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const REMOVE_BRICK_IN_PROGRESS: &str = "in progress";
const REMOVE_BRICK_COMPLETED: &str = "completed";
const REMOVE_BRICK_FAILED: &str = "failed";

// =============================================================================
// Transport
// =============================================================================

/// Runs shell commands on a host
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Run commands in order, stopping at the first failure; returns the
    /// stdout of each command
    async fn run(&self, host: &str, commands: &[String], timeout: Duration)
        -> Result<Vec<String>>;
}

/// Transport running commands on the local machine with `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

#[async_trait]
impl CommandTransport for LocalTransport {
    async fn run(
        &self,
        host: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            debug!("Running on {}: {}", host, command);
            let output = tokio::time::timeout(
                timeout,
                tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .kill_on_drop(true)
                    .output(),
            )
            .await
            .map_err(|_| Error::executor(host, format!("timed out: {}", command)))?
            .map_err(|e| Error::executor(host, e))?;

            if !output.status.success() {
                return Err(Error::executor(
                    host,
                    format!(
                        "`{}` exited with {}: {}",
                        command,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ));
            }
            outputs.push(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Ok(outputs)
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdExecutorConfig {
    /// Directory brick mount points are created under
    pub mount_root: PathBuf,
    /// Prefix commands with sudo
    pub sudo: bool,
    /// Timeout for one batch of commands
    pub command_timeout: Duration,
    /// Delay between remove-brick status polls while data migrates
    pub remove_brick_poll_interval: Duration,
    /// Give up retrying a failing status query after this long
    pub remove_brick_retry_limit: Duration,
}

impl Default for CmdExecutorConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/var/lib/brickd/mounts"),
            sudo: false,
            command_timeout: Duration::from_secs(600),
            remove_brick_poll_interval: Duration::from_secs(5),
            remove_brick_retry_limit: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// Command Executor
// =============================================================================

/// Executor issuing real storage commands through a transport
pub struct CmdExecutor<T: CommandTransport> {
    transport: T,
    config: CmdExecutorConfig,
}

impl<T: CommandTransport> CmdExecutor<T> {
    pub fn new(transport: T, config: CmdExecutorConfig) -> Self {
        Self { transport, config }
    }

    fn cmd(&self, command: String) -> String {
        if self.config.sudo {
            format!("sudo {}", command)
        } else {
            command
        }
    }

    async fn exec(&self, host: &str, commands: Vec<String>) -> Result<Vec<String>> {
        let commands: Vec<String> = commands.into_iter().map(|c| self.cmd(c)).collect();
        self.transport
            .run(host, &commands, self.config.command_timeout)
            .await
    }

    async fn exec_one(&self, host: &str, command: String) -> Result<String> {
        let mut out = self.exec(host, vec![command]).await?;
        Ok(out.pop().unwrap_or_default())
    }

    fn mount_dir(&self, brick: &BrickRequest) -> String {
        self.config
            .mount_root
            .join(format!("vg_{}", brick.vg_id))
            .join(format!("brick_{}", brick.id))
            .display()
            .to_string()
    }

    fn durability_args(durability: &Durability) -> String {
        match durability {
            Durability::Distribute => String::new(),
            Durability::Replicate { replica } => format!("replica {} ", replica),
            Durability::Disperse { data, redundancy } => {
                format!("disperse-data {} redundancy {} ", data, redundancy)
            }
        }
    }

    fn brick_list(bricks: &[BrickInfo]) -> String {
        bricks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Poll remove-brick status until data migration settles
    async fn wait_remove_brick(&self, host: &str, base: &str) -> Result<&'static str> {
        let status_cmd = format!("{}status", base);
        loop {
            let policy = ExponentialBackoffBuilder::new()
                .with_initial_interval(self.config.remove_brick_poll_interval)
                .with_max_elapsed_time(Some(self.config.remove_brick_retry_limit))
                .build();

            let output = backoff::future::retry(policy, || async {
                self.exec_one(host, status_cmd.clone()).await.map_err(|e| {
                    debug!("remove-brick status on {} failed, retrying: {}", host, e);
                    backoff::Error::transient(e)
                })
            })
            .await?;

            if output.contains(REMOVE_BRICK_IN_PROGRESS) {
                tokio::time::sleep(self.config.remove_brick_poll_interval).await;
            } else if output.contains(REMOVE_BRICK_COMPLETED) {
                return Ok(REMOVE_BRICK_COMPLETED);
            } else if output.contains(REMOVE_BRICK_FAILED) {
                return Ok(REMOVE_BRICK_FAILED);
            } else {
                return Err(Error::executor(
                    host,
                    format!("unknown remove-brick status: {}", output.trim()),
                ));
            }
        }
    }
}

#[async_trait]
impl<T: CommandTransport> Executor for CmdExecutor<T> {
    async fn glusterd_check(&self, host: &str) -> Result<()> {
        self.exec(host, vec!["systemctl status glusterd".into()])
            .await
            .map(|_| ())
    }

    async fn device_setup(&self, host: &str, device: &str, vg_id: &str) -> Result<DeviceInfo> {
        info!("Setting up device {} on {}", device, host);
        self.exec(
            host,
            vec![
                format!("pvcreate --metadatasize=128M --dataalignment=256K '{}'", device),
                format!("vgcreate --autobackup=n vg_{} '{}'", vg_id, device),
            ],
        )
        .await?;

        let output = self
            .exec_one(host, format!("vgdisplay -c vg_{}", vg_id))
            .await?;
        let size = parse_vgdisplay_free(&output)
            .ok_or_else(|| Error::executor(host, format!("unable to parse vgdisplay: {}", output.trim())))?;
        Ok(DeviceInfo { size })
    }

    async fn device_teardown(&self, host: &str, device: &str, vg_id: &str) -> Result<()> {
        self.exec(
            host,
            vec![
                format!("vgremove -qq vg_{}", vg_id),
                format!("pvremove -qq '{}'", device),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn brick_create(&self, host: &str, brick: &BrickRequest) -> Result<BrickInfo> {
        let mount = self.mount_dir(brick);
        let dev = format!("/dev/mapper/vg_{}-brick_{}", brick.vg_id, brick.id);
        info!("Creating brick {} on {}", brick.id, host);

        self.exec(
            host,
            vec![
                format!("mkdir -p {}", mount),
                format!(
                    "lvcreate -qq --autobackup=n --poolmetadatasize {}K --chunksize 256K --size {}K --thin vg_{}/tp_{} --virtualsize {}K --name brick_{}",
                    brick.pool_metadata_size, brick.tp_size, brick.vg_id, brick.id, brick.size, brick.id
                ),
                format!("mkfs.xfs -i size=512 -n size=8192 {}", dev),
                format!("mount -o rw,inode64,noatime,nouuid {} {}", dev, mount),
                format!("mkdir {}/brick", mount),
            ],
        )
        .await?;

        Ok(BrickInfo::new(host, format!("{}/brick", mount)))
    }

    async fn brick_destroy(&self, host: &str, brick: &BrickRequest) -> Result<bool> {
        let mount = self.mount_dir(brick);

        if let Err(e) = self.exec(host, vec![format!("umount {}", mount)]).await {
            warn!("Unable to unmount brick {}: {}", brick.id, e);
        }

        let reclaimed = match self
            .exec(host, vec![format!("lvremove -f vg_{}/tp_{}", brick.vg_id, brick.id)])
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Unable to remove thin pool of brick {}: {}", brick.id, e);
                false
            }
        };

        if let Err(e) = self.exec(host, vec![format!("rmdir {}", mount)]).await {
            warn!("Unable to remove mount point of brick {}: {}", brick.id, e);
        }

        Ok(reclaimed)
    }

    async fn volume_create(&self, host: &str, volume: &VolumeRequest) -> Result<VolumeInfo> {
        info!("Creating volume {} on {}", volume.name, host);
        self.exec(
            host,
            vec![
                format!(
                    "gluster --mode=script volume create {} {}{}",
                    volume.name,
                    Self::durability_args(&volume.durability),
                    Self::brick_list(&volume.bricks)
                ),
                format!("gluster --mode=script volume start {}", volume.name),
            ],
        )
        .await?;

        Ok(VolumeInfo {
            name: volume.name.clone(),
            bricks: volume.bricks.clone(),
        })
    }

    async fn volume_destroy(&self, host: &str, volume: &str) -> Result<()> {
        if let Err(e) = self
            .exec(host, vec![format!("gluster --mode=script volume stop {} force", volume)])
            .await
        {
            warn!("Unable to stop volume {}: {}", volume, e);
        }
        self.exec(host, vec![format!("gluster --mode=script volume delete {}", volume)])
            .await
            .map(|_| ())
    }

    async fn volume_add_brick(
        &self,
        host: &str,
        volume: &str,
        bricks: &[BrickInfo],
        replica: Option<usize>,
    ) -> Result<()> {
        let replica = replica.map(|r| format!("replica {} ", r)).unwrap_or_default();
        self.exec(
            host,
            vec![format!(
                "gluster --mode=script volume add-brick {} {}{}",
                volume,
                replica,
                Self::brick_list(bricks)
            )],
        )
        .await
        .map(|_| ())
    }

    async fn volume_remove_brick(
        &self,
        host: &str,
        volume: &str,
        brick: &BrickInfo,
        replica: Option<usize>,
    ) -> Result<()> {
        let base = format!("gluster --mode=script volume remove-brick {} ", volume);

        if let Some(replica) = replica {
            // Reducing the replica count needs no data migration
            return self
                .exec(host, vec![format!("{}replica {} {} force", base, replica, brick)])
                .await
                .map(|_| ());
        }

        let base = format!("{}{} ", base, brick);
        self.exec(host, vec![format!("{}start", base)]).await?;

        let status = self.wait_remove_brick(host, &base).await?;
        if status == REMOVE_BRICK_FAILED {
            return Err(Error::executor(
                host,
                format!("data migration off brick {} failed", brick),
            ));
        }

        self.exec(host, vec![format!("{}commit", base)])
            .await
            .map(|_| ())
    }

    async fn volume_replace_brick(
        &self,
        host: &str,
        volume: &str,
        old: &BrickInfo,
        new: &BrickInfo,
    ) -> Result<()> {
        self.exec(
            host,
            vec![format!(
                "gluster --mode=script volume replace-brick {} {} {} commit force",
                volume, old, new
            )],
        )
        .await
        .map(|_| ())
    }

    async fn volume_info(&self, host: &str, volume: &str) -> Result<VolumeInfo> {
        let output = self
            .exec_one(host, format!("gluster --mode=script volume info {}", volume))
            .await?;
        Ok(VolumeInfo {
            name: volume.to_string(),
            bricks: parse_volume_info(&output),
        })
    }

    async fn heal_info(&self, host: &str, volume: &str) -> Result<HealInfo> {
        let output = self
            .exec_one(host, format!("gluster --mode=script volume heal {} info", volume))
            .await?;
        Ok(parse_heal_info(&output))
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

fn parse_brick(addr: &str) -> Option<BrickInfo> {
    let (host, path) = addr.trim().split_once(':')?;
    Some(BrickInfo::new(host, path))
}

/// Bricks listed as `BrickN: host:/path` in `gluster volume info`
pub fn parse_volume_info(output: &str) -> Vec<BrickInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(": ")?;
            let n = key.strip_prefix("Brick")?;
            if n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            parse_brick(value)
        })
        .collect()
}

/// Per-brick entry counts from `gluster volume heal <vol> info`
///
/// A `-` count means the brick is down.
pub fn parse_heal_info(output: &str) -> HealInfo {
    let mut bricks: Vec<BrickHealStatus> = Vec::new();
    for line in output.lines().map(str::trim) {
        if let Some(addr) = line.strip_prefix("Brick ") {
            if let Some(brick) = parse_brick(addr) {
                bricks.push(BrickHealStatus {
                    brick,
                    entries: None,
                });
            }
        } else if let Some(count) = line.strip_prefix("Number of entries:") {
            if let Some(last) = bricks.last_mut() {
                last.entries = count.trim().parse().ok();
            }
        }
    }
    HealInfo { bricks }
}

/// Free space in KiB from `vgdisplay -c`: free extents times extent size
pub fn parse_vgdisplay_free(output: &str) -> Option<u64> {
    let fields: Vec<&str> = output.trim().split(':').collect();
    let extent_size: u64 = fields.get(12)?.trim().parse().ok()?;
    let free_extents: u64 = fields.get(15)?.trim().parse().ok()?;
    Some(extent_size * free_extents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records commands and answers from a script keyed by command prefix
    #[derive(Default, Clone)]
    struct FakeTransport {
        log: Arc<Mutex<Vec<String>>>,
        replies: Arc<Mutex<Vec<(String, Vec<Result<String>>)>>>,
    }

    impl FakeTransport {
        fn reply(&self, prefix: &str, outputs: Vec<Result<String>>) {
            self.replies.lock().push((prefix.to_string(), outputs));
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl CommandTransport for FakeTransport {
        async fn run(
            &self,
            _host: &str,
            commands: &[String],
            _timeout: Duration,
        ) -> Result<Vec<String>> {
            let mut out = Vec::new();
            for command in commands {
                self.log.lock().push(command.clone());
                let mut replies = self.replies.lock();
                let scripted = replies
                    .iter_mut()
                    .find(|(prefix, outputs)| command.starts_with(prefix.as_str()) && !outputs.is_empty())
                    .map(|(_, outputs)| outputs.remove(0));
                match scripted {
                    Some(Ok(s)) => out.push(s),
                    Some(Err(e)) => return Err(e),
                    None => out.push(String::new()),
                }
            }
            Ok(out)
        }
    }

    fn executor(transport: FakeTransport) -> CmdExecutor<FakeTransport> {
        CmdExecutor::new(
            transport,
            CmdExecutorConfig {
                remove_brick_poll_interval: Duration::from_millis(1),
                remove_brick_retry_limit: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_parse_volume_info() {
        let output = "\
Volume Name: vol1
Type: Replicate
Number of Bricks: 1 x 3 = 3
Bricks:
Brick1: 10.0.0.1:/var/lib/brickd/mounts/vg_a/brick_1/brick
Brick2: 10.0.0.2:/var/lib/brickd/mounts/vg_b/brick_2/brick
Brick3: 10.0.0.3:/var/lib/brickd/mounts/vg_c/brick_3/brick
Options Reconfigured:
transport.address-family: inet
";
        let bricks = parse_volume_info(output);
        assert_eq!(bricks.len(), 3);
        assert_eq!(bricks[1].host, "10.0.0.2");
        assert_eq!(bricks[1].path, "/var/lib/brickd/mounts/vg_b/brick_2/brick");
    }

    #[test]
    fn test_parse_heal_info() {
        let output = "\
Brick 10.0.0.1:/bricks/a/brick
/file1
/file2
Status: Connected
Number of entries: 2

Brick 10.0.0.2:/bricks/b/brick
Status: Transport endpoint is not connected
Number of entries: -

Brick 10.0.0.3:/bricks/c/brick
Status: Connected
Number of entries: 0
";
        let heal = parse_heal_info(output);
        assert_eq!(heal.bricks.len(), 3);
        assert_eq!(heal.bricks[0].entries, Some(2));
        assert_eq!(heal.bricks[1].entries, None);
        assert_eq!(heal.bricks[2].entries, Some(0));
    }

    #[test]
    fn test_parse_vgdisplay() {
        let output = "  vg_abc:r/w:772:-1:0:0:0:-1:0:1:1:104853504:4096:25599:0:25599:xyz";
        assert_eq!(parse_vgdisplay_free(output), Some(4096 * 25599));
        assert_eq!(parse_vgdisplay_free("garbage"), None);
    }

    #[tokio::test]
    async fn test_brick_create_commands() {
        let transport = FakeTransport::default();
        let exec = executor(transport.clone());
        let brick = BrickRequest {
            id: "b1".into(),
            vg_id: "d1".into(),
            size: 1000,
            tp_size: 2000,
            pool_metadata_size: 10,
            path: String::new(),
        };

        let info = exec.brick_create("node1", &brick).await.unwrap();
        assert_eq!(info.path, "/var/lib/brickd/mounts/vg_d1/brick_b1/brick");

        let commands = transport.commands();
        assert_eq!(commands.len(), 5);
        assert!(commands[1].contains("--poolmetadatasize 10K"));
        assert!(commands[1].contains("--size 2000K --thin vg_d1/tp_b1 --virtualsize 1000K"));
    }

    #[tokio::test]
    async fn test_remove_brick_with_replica_forces() {
        let transport = FakeTransport::default();
        let exec = executor(transport.clone());
        let brick = BrickInfo::new("10.0.0.1", "/b");

        exec.volume_remove_brick("node1", "vol", &brick, Some(2))
            .await
            .unwrap();
        assert_eq!(
            transport.commands(),
            vec!["gluster --mode=script volume remove-brick vol replica 2 10.0.0.1:/b force"]
        );
    }

    #[tokio::test]
    async fn test_remove_brick_polls_until_completed() {
        let transport = FakeTransport::default();
        transport.reply(
            "gluster --mode=script volume remove-brick vol 10.0.0.1:/b status",
            vec![
                Err(Error::executor("node1", "glusterd busy")),
                Ok("in progress".into()),
                Ok("completed".into()),
            ],
        );
        let exec = executor(transport.clone());

        exec.volume_remove_brick("node1", "vol", &BrickInfo::new("10.0.0.1", "/b"), None)
            .await
            .unwrap();

        let commands = transport.commands();
        assert!(commands.first().unwrap().ends_with("start"));
        assert_eq!(commands.iter().filter(|c| c.ends_with("status")).count(), 3);
        assert!(commands.last().unwrap().ends_with("commit"));
    }

    #[tokio::test]
    async fn test_remove_brick_failed_migration() {
        let transport = FakeTransport::default();
        transport.reply(
            "gluster --mode=script volume remove-brick vol 10.0.0.1:/b status",
            vec![Ok("failed".into())],
        );
        let exec = executor(transport.clone());

        let result = exec
            .volume_remove_brick("node1", "vol", &BrickInfo::new("10.0.0.1", "/b"), None)
            .await;
        assert!(result.is_err());
        assert!(!transport.commands().iter().any(|c| c.ends_with("commit")));
    }

    #[tokio::test]
    async fn test_volume_create_replica_args() {
        let transport = FakeTransport::default();
        let exec = executor(transport.clone());

        exec.volume_create(
            "node1",
            &VolumeRequest {
                name: "vol".into(),
                durability: Durability::Replicate { replica: 2 },
                bricks: vec![BrickInfo::new("h1", "/a"), BrickInfo::new("h2", "/b")],
            },
        )
        .await
        .unwrap();

        assert_eq!(
            transport.commands()[0],
            "gluster --mode=script volume create vol replica 2 h1:/a h2:/b"
        );
    }
}
