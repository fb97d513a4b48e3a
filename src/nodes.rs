use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

use crate::config::Timeouts;
use crate::poll::{AttemptError, Eventually, WaitContext, WaitError};

pub const WORKER_NODE_ROLE_LABEL: &str = "node-role.kubernetes.io/worker";

/// True when the node's `Ready` condition is `True`.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

pub fn filter_ready_nodes(nodes: &[Node]) -> Vec<&Node> {
    nodes.iter().filter(|n| is_node_ready(n)).collect()
}

/// True when every node in `nodes` is Ready.
pub fn nodes_are_ready(nodes: &[Node]) -> bool {
    let ready = filter_ready_nodes(nodes).len();
    debug!(ready, total = nodes.len(), "node readiness");
    ready == nodes.len()
}

/// Nodes matching `labels` (all nodes when empty).
pub async fn list_nodes(client: &Client, labels: &str) -> Result<Vec<Node>, kube::Error> {
    let api: Api<Node> = Api::all(client.clone());
    let params = if labels.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(labels)
    };
    Ok(api.list(&params).await?.items)
}

pub async fn worker_nodes(client: &Client) -> Result<Vec<Node>, kube::Error> {
    list_nodes(client, WORKER_NODE_ROLE_LABEL).await
}

/// Wait until every node in the cluster reports Ready. List errors are retried.
pub async fn wait_until_all_nodes_ready(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
) -> Result<(), WaitError> {
    let total = Eventually::new(ctx)
        .timeout(timeouts.nodes_ready)
        .poll_interval(timeouts.retry_medium)
        .describe("all nodes ready")
        .until(async |_| -> Result<usize, AttemptError> {
            let nodes = list_nodes(client, "")
                .await
                .map_err(|error| AttemptError::retry(format!("error listing nodes: {error}")))?;
            let not_ready: Vec<String> = nodes
                .iter()
                .filter(|n| !is_node_ready(n))
                .map(|n| n.name_any())
                .collect();
            if not_ready.is_empty() {
                Ok(nodes.len())
            } else {
                Err(AttemptError::retry(format!(
                    "{} of {} nodes not ready: {}",
                    not_ready.len(),
                    nodes.len(),
                    not_ready.join(", ")
                )))
            }
        })
        .await?;
    info!(nodes = total, "all nodes ready");
    Ok(())
}

/// Wait until the named node is gone.
pub async fn wait_until_node_does_not_exist(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    name: &str,
) -> Result<(), WaitError> {
    let api: Api<Node> = Api::all(client.clone());
    Eventually::new(ctx)
        .timeout(timeouts.wait_long)
        .poll_interval(timeouts.retry_medium)
        .describe("node deleted")
        .until(async |_| -> Result<(), AttemptError> {
            match api.get_opt(name).await {
                Ok(None) => Ok(()),
                Ok(Some(_)) => Err(AttemptError::retry(format!("node {name} still exists"))),
                Err(error) => Err(AttemptError::retry(format!(
                    "error querying api for node {name}: {error}"
                ))),
            }
        })
        .await?;
    info!(node = name, "node deleted");
    Ok(())
}
