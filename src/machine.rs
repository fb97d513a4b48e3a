use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, ObjectReference, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::Timeouts;
use crate::infrastructure::InfrastructureError;
use crate::nodes::is_node_ready;
use crate::poll::{Assertions, AttemptError, Eventually, WaitContext, WaitError, run_check_until_every};
use crate::providers::ProviderError;

pub const CLUSTER_KEY: &str = "machine.openshift.io/cluster-api-cluster";
pub const MACHINE_SET_KEY: &str = "machine.openshift.io/cluster-api-machineset";
pub const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";
pub const MACHINE_TYPE_LABEL: &str = "machine.openshift.io/cluster-api-machine-type";
/// Node annotation holding the `namespace/name` of the backing Machine.
pub const MACHINE_ANNOTATION_KEY: &str = "machine.openshift.io/machine";

/// Opaque provider configuration embedded in a Machine spec.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<serde_json::Value>,
}

/// Desired state of a Machine API machine (`machine.openshift.io/v1beta1`).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[kube(status = "MachineStatus")]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub provider_spec: ProviderSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Kept as a string so phases added by newer controllers still parse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,
}

/// A group of identical machines (`machine.openshift.io/v1beta1`).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "MachineSet",
    namespaced
)]
#[kube(status = "MachineSetStatus")]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// `None` means zero replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: MachineTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: MachineSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

/// Lifecycle phase reported in `Machine.status.phase`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MachinePhase {
    Provisioning,
    Provisioned,
    Running,
    Deleting,
    Failed,
}

impl MachinePhase {
    pub fn parse(phase: &str) -> Option<Self> {
        match phase {
            "Provisioning" => Some(Self::Provisioning),
            "Provisioned" => Some(Self::Provisioned),
            "Running" => Some(Self::Running),
            "Deleting" => Some(Self::Deleting),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Provisioned => write!(f, "Provisioned"),
            Self::Running => write!(f, "Running"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl Machine {
    pub fn phase(&self) -> Option<MachinePhase> {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(MachinePhase::parse)
    }

    pub fn node_ref_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }

    /// Failure reason and message for logging a Failed machine.
    pub fn failure_summary(&self) -> String {
        let status = self.status.as_ref();
        let reason = status
            .and_then(|s| s.error_reason.as_deref())
            .unwrap_or("failureReason not present in Machine.status");
        let message = status
            .and_then(|s| s.error_message.as_deref())
            .unwrap_or("failureMessage not present in Machine.status");
        format!("Reason: {reason}, Message: {message}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("{0}: machine has no NodeRef")]
    NoNodeRef(String),

    #[error("node {node:?} does not have a {key:?} annotation", key = MACHINE_ANNOTATION_KEY)]
    MissingMachineAnnotation { node: String },

    #[error("machine annotation format is incorrect: {0:?}")]
    MalformedMachineAnnotation(String),

    #[error("Machine {key:?} is forbidden to live outside of the {expected} namespace")]
    ForeignNamespace { key: String, expected: String },

    #[error("no worker MachineSets found in {0}")]
    NoWorkerMachineSets(String),

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("machine creation failed due to insufficient cloud provider capacity: {0}")]
    InsufficientCapacity(String),
}

/// Render a label selector in the `key=value,key in (a,b)` list syntax.
pub fn label_selector_string(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.as_deref().unwrap_or_default().join(",");
        parts.push(match req.operator.as_str() {
            "In" => format!("{} in ({values})", req.key),
            "NotIn" => format!("{} notin ({values})", req.key),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            other => format!("{} {other} ({values})", req.key),
        });
    }

    parts.join(",")
}

fn list_params(selector: Option<&LabelSelector>) -> ListParams {
    match selector.map(label_selector_string) {
        Some(labels) if !labels.is_empty() => ListParams::default().labels(&labels),
        _ => ListParams::default(),
    }
}

pub fn filter_machines(machines: &[Machine], phase: MachinePhase) -> Vec<&Machine> {
    machines
        .iter()
        .filter(|m| m.phase() == Some(phase))
        .collect()
}

pub fn filter_running_machines(machines: &[Machine]) -> Vec<&Machine> {
    filter_machines(machines, MachinePhase::Running)
}

/// True when `owner` is the controlling owner of `machine`.
pub fn is_controlled_by(machine: &Machine, owner: &MachineSet) -> bool {
    let Some(uid) = owner.uid() else {
        return false;
    };
    machine
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

pub async fn get_machine_set(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<MachineSet, MachineError> {
    let api: Api<MachineSet> = Api::namespaced(client.clone(), namespace);
    Ok(api.get(name).await?)
}

pub async fn list_machine_sets(
    client: &Client,
    namespace: &str,
    selector: Option<&LabelSelector>,
) -> Result<Vec<MachineSet>, MachineError> {
    let api: Api<MachineSet> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&list_params(selector)).await?.items)
}

/// MachineSets whose machine template carries the worker role label.
///
/// The installer labels the Machines rather than the MachineSets, so the
/// template labels are inspected.
pub async fn worker_machine_sets(
    client: &Client,
    namespace: &str,
) -> Result<Vec<MachineSet>, MachineError> {
    let workers: Vec<_> = list_machine_sets(client, namespace, None)
        .await?
        .into_iter()
        .filter(|ms| {
            ms.spec.template.metadata.labels.get(MACHINE_ROLE_LABEL).map(String::as_str)
                == Some("worker")
        })
        .collect();

    if workers.is_empty() {
        return Err(MachineError::NoWorkerMachineSets(namespace.to_string()));
    }
    Ok(workers)
}

pub async fn list_machines(
    client: &Client,
    namespace: &str,
    selector: Option<&LabelSelector>,
) -> Result<Vec<Machine>, MachineError> {
    let api: Api<Machine> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&list_params(selector)).await?.items)
}

/// Machines in the MachineSet's namespace controlled by it.
pub async fn machines_from_machine_set(
    client: &Client,
    machine_set: &MachineSet,
) -> Result<Vec<Machine>, MachineError> {
    let namespace = machine_set.namespace().unwrap_or_default();
    Ok(list_machines(client, &namespace, None)
        .await?
        .into_iter()
        .filter(|m| is_controlled_by(m, machine_set))
        .collect())
}

/// The Node backing `machine`, via its `status.nodeRef`.
pub async fn node_for_machine(client: &Client, machine: &Machine) -> Result<Node, MachineError> {
    let name = machine
        .node_ref_name()
        .ok_or_else(|| MachineError::NoNodeRef(machine.name_any()))?;
    let nodes: Api<Node> = Api::all(client.clone());
    Ok(nodes.get(name).await?)
}

/// Parse the Machine annotation on `node` into `(namespace, name)`.
///
/// Machines outside `expected_namespace` are rejected.
pub fn machine_from_node_annotation(
    node: &Node,
    expected_namespace: &str,
) -> Result<(String, String), MachineError> {
    let key = node
        .annotations()
        .get(MACHINE_ANNOTATION_KEY)
        .ok_or_else(|| MachineError::MissingMachineAnnotation {
            node: node.name_any(),
        })?;

    let (namespace, name) = match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => (ns, name),
        _ => return Err(MachineError::MalformedMachineAnnotation(key.clone())),
    };

    if namespace != expected_namespace {
        return Err(MachineError::ForeignNamespace {
            key: key.clone(),
            expected: expected_namespace.to_string(),
        });
    }
    Ok((namespace.to_string(), name.to_string()))
}

/// The Machine that provisioned `node`.
pub async fn machine_from_node(
    client: &Client,
    node: &Node,
    expected_namespace: &str,
) -> Result<Machine, MachineError> {
    let (namespace, name) = machine_from_node_annotation(node, expected_namespace)?;
    let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
    Ok(api.get(&name).await?)
}

/// Wait until every Machine of the MachineSet is Running and backed by a
/// Ready Node. Ends early if any of its Machines enters the Failed phase.
pub async fn wait_for_machine_set(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    namespace: &str,
    name: &str,
) -> Result<(), MachineError> {
    let machine_set = get_machine_set(client, namespace, name).await?;
    let replicas = usize::try_from(machine_set.spec.replicas.unwrap_or(0)).unwrap_or(0);

    let ctx = ctx.child_with_timeout(timeouts.wait_over_long);
    run_check_until_every(
        &ctx,
        timeouts.retry_medium,
        async |_, g| no_failed_machines(client, &machine_set, g).await,
        async |_, g| machine_set_running(client, &machine_set, replicas, g).await,
    )
    .await?;

    info!(machine_set = name, replicas, "all machines running and nodes ready");
    Ok(())
}

async fn no_failed_machines(client: &Client, machine_set: &MachineSet, g: &Assertions) -> bool {
    let machines = match machines_from_machine_set(client, machine_set).await {
        Ok(machines) => machines,
        Err(error) => {
            // Not an observed failure, the condition reports it.
            debug!(%error, "could not list machines for failure check");
            return true;
        }
    };

    let failed = filter_machines(&machines, MachinePhase::Failed);
    if failed.is_empty() {
        return true;
    }

    error!(count = failed.len(), "found Machines in failed phase");
    for machine in failed {
        let summary = machine.failure_summary();
        error!(machine = %machine.name_any(), %summary, "failed machine");
        g.fail(format!("machine {} is Failed: {summary}", machine.name_any()));
    }
    false
}

async fn machine_set_running(
    client: &Client,
    machine_set: &MachineSet,
    replicas: usize,
    g: &Assertions,
) -> bool {
    let name = machine_set.name_any();
    let Some(machines) = g.expect_ok(
        machines_from_machine_set(client, machine_set).await,
        "error querying api for machines",
    ) else {
        return false;
    };

    if machines.len() != replicas {
        return g.fail(format!(
            "{name:?}: found {} Machines, but MachineSet has {replicas} replicas",
            machines.len()
        ));
    }

    let running = filter_running_machines(&machines);
    if running.len() != machines.len() {
        return g.fail(format!(
            "{name:?}: not all Machines are running: {} of {}",
            running.len(),
            machines.len()
        ));
    }

    for machine in running {
        let Some(node) = g.expect_ok(node_for_machine(client, machine).await, "getting node") else {
            return false;
        };
        if !is_node_ready(&node) {
            return g.fail(format!("{}: node is not ready", node.name_any()));
        }
    }
    true
}

/// Wait until none of `machines` can be found.
pub async fn wait_for_machines_deleted(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    machines: &[Machine],
) -> Result<(), MachineError> {
    Eventually::new(ctx)
        .timeout(timeouts.wait_long)
        .poll_interval(timeouts.retry_medium)
        .describe("machines deleted")
        .until(async |_| -> Result<(), AttemptError> {
            for machine in machines {
                let namespace = machine.namespace().unwrap_or_default();
                let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
                match api.get_opt(&machine.name_any()).await {
                    Ok(None) => {}
                    Ok(Some(_)) => {
                        return Err(AttemptError::retry(format!(
                            "machine {} not yet deleted",
                            machine.name_any()
                        )));
                    }
                    Err(error) => {
                        return Err(AttemptError::retry(format!(
                            "error querying api for machine {}: {error}",
                            machine.name_any()
                        )));
                    }
                }
            }
            Ok(())
        })
        .await?;
    Ok(())
}

/// Wait until each MachineSet and all Machines matching its selector are gone.
///
/// A short first phase waits for the deletion timestamp to appear; if it
/// never does there is no point in the longer wait for machines to drain.
pub async fn wait_for_machine_sets_deleted(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    machine_sets: &[MachineSet],
) -> Result<(), MachineError> {
    for machine_set in machine_sets {
        let name = machine_set.name_any();
        let namespace = machine_set.namespace().unwrap_or_default();
        let api: Api<MachineSet> = Api::namespaced(client.clone(), &namespace);

        Eventually::new(ctx)
            .timeout(timeouts.wait_short)
            .poll_interval(timeouts.retry_short)
            .describe("machine set deletion timestamp")
            .until(async |_| -> Result<(), AttemptError> {
                match api.get_opt(&name).await {
                    Ok(None) => Ok(()),
                    Ok(Some(current)) if current.metadata.deletion_timestamp.is_some() => Ok(()),
                    Ok(Some(_)) => Err(AttemptError::retry(format!(
                        "MachineSet {name} still exists and does not have a deletion timestamp"
                    ))),
                    Err(error) => Err(AttemptError::retry(format!(
                        "could not fetch MachineSet {name}: {error}"
                    ))),
                }
            })
            .await?;

        Eventually::new(ctx)
            .timeout(timeouts.wait_long)
            .poll_interval(timeouts.retry_medium)
            .describe("machine set deleted")
            .until(async |_| -> Result<(), AttemptError> {
                let machines = list_machines(client, &namespace, Some(&machine_set.spec.selector))
                    .await
                    .map_err(|error| {
                        AttemptError::retry(format!(
                            "could not fetch Machines for MachineSet {name}: {error}"
                        ))
                    })?;
                if !machines.is_empty() {
                    return Err(AttemptError::retry(format!(
                        "{} Machines still present for MachineSet {name}",
                        machines.len()
                    )));
                }
                match api.get_opt(&name).await {
                    Ok(None) => Ok(()),
                    Ok(Some(_)) => Err(AttemptError::retry(format!(
                        "MachineSet {name} still present, but has no Machines"
                    ))),
                    Err(error) => Err(AttemptError::retry(format!(
                        "could not fetch MachineSet {name}: {error}"
                    ))),
                }
            })
            .await?;

        info!(machine_set = %name, "machine set deleted");
    }
    Ok(())
}
