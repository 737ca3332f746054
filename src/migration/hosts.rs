//! Command host selection

use crate::domain::Executor;
use crate::error::{Error, Result};
use crate::store::{ClusterEntry, Db, NodeEntry};
use tracing::debug;

/// Pick the node to run volume commands from
///
/// The preferred node is used when it is online and its management daemon
/// answers; otherwise the first online node of the cluster that answers.
pub async fn command_host(
    db: &Db,
    executor: &dyn Executor,
    preferred: Option<&str>,
    cluster_id: &str,
) -> Result<String> {
    let candidates = db.view(|tx| {
        let mut hosts = Vec::new();
        if let Some(id) = preferred {
            if let Some(node) = tx.try_get::<NodeEntry>(id)? {
                if node.is_online() {
                    hosts.push(node.manage_hostname().to_string());
                }
            }
        }

        let cluster: ClusterEntry = tx.get(cluster_id)?;
        for id in &cluster.nodes {
            if Some(id.as_str()) == preferred {
                continue;
            }
            let node: NodeEntry = tx.get(id)?;
            if node.is_online() {
                hosts.push(node.manage_hostname().to_string());
            }
        }
        Ok(hosts)
    })?;

    for host in candidates {
        match executor.glusterd_check(&host).await {
            Ok(()) => return Ok(host),
            Err(e) => debug!("Skipping {} as command host: {}", host, e),
        }
    }

    Err(Error::executor(
        format!("cluster {}", cluster_id),
        "no reachable node to run commands from",
    ))
}
