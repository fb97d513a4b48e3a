//! Dedicated MachineSets created by tests, and waits that tolerate the
//! cloud running out of capacity.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Timeouts;
use crate::infrastructure::infrastructure_name;
use crate::machine::{
    CLUSTER_KEY, MachineError, MachinePhase, MachineSet, MachineSetSpec, MachineSpec,
    MachineTemplateSpec, ProviderSpec, TemplateMeta, filter_machines, filter_running_machines,
    get_machine_set, machines_from_machine_set, node_for_machine, worker_machine_sets,
};
use crate::nodes::is_node_ready;
use crate::poll::{AttemptError, Eventually, WaitContext, WaitError};
use crate::providers::Provider;

/// Label carrying a per-run id on every resource a test creates.
pub const E2E_LABEL: &str = "e2e.openshift.io";
/// Taint keeping ordinary workloads off test machines.
pub const ACTUATOR_PKG_TAINT: &str = "cluster-api-actuator-pkg";

/// Everything needed to create a test MachineSet.
#[derive(Debug, Clone)]
pub struct MachineSetParams {
    /// Used as `generateName`.
    pub name: String,
    pub replicas: i32,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub provider_spec: ProviderSpec,
}

/// Params for a new MachineSet copying the first worker MachineSet's
/// providerSpec, tagged with a fresh run id.
pub async fn build_machine_set_params(
    client: &Client,
    namespace: &str,
    replicas: i32,
) -> Result<MachineSetParams, MachineError> {
    let workers = worker_machine_sets(client, namespace).await?;
    let template = &workers[0].spec.template;
    let cluster_name = template
        .metadata
        .labels
        .get(CLUSTER_KEY)
        .cloned()
        .unwrap_or_default();
    let name = infrastructure_name(client).await?;

    Ok(MachineSetParams {
        name,
        replicas,
        labels: BTreeMap::from([
            (E2E_LABEL.to_string(), Uuid::new_v4().to_string()),
            (CLUSTER_KEY.to_string(), cluster_name),
        ]),
        taints: vec![Taint {
            key: ACTUATOR_PKG_TAINT.to_string(),
            effect: "PreferNoSchedule".to_string(),
            ..Default::default()
        }],
        provider_spec: template.spec.provider_spec.clone(),
    })
}

/// One params copy per alternative instance type of the platform.
pub fn alternative_machine_set_params(
    params: &MachineSetParams,
    provider: &Provider,
) -> Result<Vec<MachineSetParams>, MachineError> {
    let base = params.provider_spec.value.clone().unwrap_or_default();
    provider
        .alternative_instance_types()?
        .iter()
        .map(|instance_type| -> Result<MachineSetParams, MachineError> {
            let value = provider.build_template(&base, instance_type)?;
            Ok(MachineSetParams {
                provider_spec: ProviderSpec { value: Some(value) },
                ..params.clone()
            })
        })
        .collect()
}

pub fn machine_set_from_params(namespace: &str, params: &MachineSetParams) -> MachineSet {
    MachineSet {
        metadata: ObjectMeta {
            generate_name: Some(params.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(params.labels.clone()),
            ..Default::default()
        },
        spec: MachineSetSpec {
            replicas: Some(params.replicas),
            selector: LabelSelector {
                match_labels: Some(params.labels.clone()),
                ..Default::default()
            },
            template: MachineTemplateSpec {
                metadata: TemplateMeta {
                    labels: params.labels.clone(),
                },
                spec: MachineSpec {
                    provider_spec: params.provider_spec.clone(),
                    taints: params.taints.clone(),
                    provider_id: None,
                },
            },
        },
        status: None,
    }
}

pub async fn create_machine_set(
    client: &Client,
    namespace: &str,
    params: &MachineSetParams,
) -> Result<MachineSet, MachineError> {
    let api: Api<MachineSet> = Api::namespaced(client.clone(), namespace);
    let created = api
        .create(&PostParams::default(), &machine_set_from_params(namespace, params))
        .await?;
    info!(machine_set = %created.name_any(), replicas = params.replicas, "created machine set");
    Ok(created)
}

pub async fn delete_machine_sets(
    client: &Client,
    machine_sets: &[MachineSet],
) -> Result<(), MachineError> {
    for machine_set in machine_sets {
        let namespace = machine_set.namespace().unwrap_or_default();
        let api: Api<MachineSet> = Api::namespaced(client.clone(), &namespace);
        if let Err(error) = api.delete(&machine_set.name_any(), &DeleteParams::default()).await {
            error!(machine_set = %machine_set.name_any(), %error, "could not delete machine set");
            return Err(error.into());
        }
    }
    Ok(())
}

/// Like [`crate::machine::wait_for_machine_set`], but a Machine that the
/// cloud could not provision for lack of capacity ends the wait with
/// [`MachineError::InsufficientCapacity`] so the caller can retry with
/// another instance type.
pub async fn wait_for_spot_machine_set(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    provider: &Provider,
    namespace: &str,
    name: &str,
) -> Result<(), MachineError> {
    let machine_set = get_machine_set(client, namespace, name).await?;
    let replicas = usize::try_from(machine_set.spec.replicas.unwrap_or(0)).unwrap_or(0);
    let mut out_of_capacity: Option<String> = None;

    let result = Eventually::new(ctx)
        .timeout(timeouts.wait_long)
        .poll_interval(timeouts.retry_medium)
        .describe("spot machine set running")
        .until(async |_| -> Result<(), AttemptError> {
            let machines = machines_from_machine_set(client, &machine_set)
                .await
                .map_err(|error| {
                    AttemptError::stop(format!(
                        "error getting machines from machineSet {name}: {error}"
                    ))
                })?;

            if machines.len() != replicas {
                return Err(AttemptError::retry(format!(
                    "{name:?}: found {} Machines, but MachineSet has {replicas} replicas",
                    machines.len()
                )));
            }

            let failed = filter_machines(&machines, MachinePhase::Failed);
            if !failed.is_empty() {
                for machine in &failed {
                    error!(machine = %machine.name_any(), summary = %machine.failure_summary(), "failed machine");
                }
                return Err(AttemptError::stop(format!(
                    "found {} Machines in failed phase",
                    failed.len()
                )));
            }

            for machine in &machines {
                let status = machine.status.as_ref().and_then(|s| s.provider_status.as_ref());
                let exhausted = provider.has_insufficient_capacity(status).map_err(|error| {
                    AttemptError::stop(format!(
                        "error checking if machine {} has insufficient capacity: {error}",
                        machine.name_any()
                    ))
                })?;
                if exhausted {
                    out_of_capacity = Some(machine.name_any());
                    return Err(AttemptError::stop(format!(
                        "machine {} has insufficient capacity",
                        machine.name_any()
                    )));
                }
            }

            let running = filter_running_machines(&machines);
            if running.len() != machines.len() {
                return Err(AttemptError::retry(format!(
                    "{name:?}: not all Machines are running: {} of {}",
                    running.len(),
                    machines.len()
                )));
            }

            for machine in running {
                let node = node_for_machine(client, machine).await.map_err(|error| {
                    AttemptError::retry(format!(
                        "node for machine {} not found yet: {error}",
                        machine.name_any()
                    ))
                })?;
                if !is_node_ready(&node) {
                    return Err(AttemptError::retry(format!(
                        "{}: node is not ready",
                        node.name_any()
                    )));
                }
            }
            Ok(())
        })
        .await;

    match (result, out_of_capacity) {
        (Ok(()), _) => Ok(()),
        (Err(WaitError::StoppedTrying { .. }), Some(machine)) => {
            Err(MachineError::InsufficientCapacity(machine))
        }
        (Err(err), _) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use http::{Method, Request, Response};
    use kube::client::Body;
    use serde_json::json;

    use crate::machine::{MACHINE_ROLE_LABEL, Machine};
    use crate::providers::aws::AwsProvider;

    const NS: &str = "openshift-machine-api";

    fn params() -> MachineSetParams {
        MachineSetParams {
            name: "ci-ln-abc12-76ef8".into(),
            replicas: 1,
            labels: BTreeMap::from([(E2E_LABEL.to_string(), "run-1".to_string())]),
            taints: vec![],
            provider_spec: ProviderSpec {
                value: Some(json!({
                    "kind": "AWSMachineProviderConfig",
                    "instanceType": "m6i.xlarge",
                    "placement": { "availabilityZone": "us-east-1b" }
                })),
            },
        }
    }

    fn respond(body: serde_json::Value) -> Response<Body> {
        Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn worker_set(name: &str, role: &str, instance_type: &str) -> serde_json::Value {
        json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "MachineSet",
            "metadata": { "name": name, "namespace": NS, "uid": format!("uid-{name}") },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "machine.openshift.io/cluster-api-machineset": name } },
                "template": {
                    "metadata": {
                        "labels": {
                            MACHINE_ROLE_LABEL: role,
                            CLUSTER_KEY: "ci-ln-abc12-76ef8"
                        }
                    },
                    "spec": {
                        "providerSpec": {
                            "value": {
                                "kind": "AWSMachineProviderConfig",
                                "instanceType": instance_type
                            }
                        }
                    }
                }
            }
        })
    }

    /// Serve the `spot` MachineSet with one replica owning `machine`.
    fn spawn_spot_api(machine: serde_json::Value) -> Client {
        let (mock_svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let path = request.uri().path().to_string();
                if path.ends_with("/machinesets/spot") {
                    send.send_response(respond(json!({
                        "apiVersion": "machine.openshift.io/v1beta1",
                        "kind": "MachineSet",
                        "metadata": { "name": "spot", "namespace": NS, "uid": "set-uid" },
                        "spec": { "replicas": 1 }
                    })));
                } else if path.ends_with("/machines") {
                    send.send_response(respond(json!({
                        "apiVersion": "machine.openshift.io/v1beta1",
                        "kind": "MachineList",
                        "metadata": {},
                        "items": [machine]
                    })));
                } else {
                    panic!("unexpected request: {path}");
                }
            }
        });
        Client::new(mock_svc, "default")
    }

    fn spot_machine(status: serde_json::Value) -> serde_json::Value {
        let machine: Machine = serde_json::from_value(json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "spot-a",
                "namespace": NS,
                "ownerReferences": [{
                    "apiVersion": "machine.openshift.io/v1beta1",
                    "kind": "MachineSet",
                    "name": "spot",
                    "uid": "set-uid",
                    "controller": true
                }]
            },
            "spec": {},
            "status": status
        }))
        .unwrap();
        serde_json::to_value(machine).unwrap()
    }

    fn spot_timeouts() -> Timeouts {
        Timeouts {
            retry_medium: Duration::from_millis(100),
            wait_long: Duration::from_secs(1),
            ..Timeouts::default()
        }
    }

    #[test]
    fn alternatives_swap_instance_type() {
        let alternatives =
            alternative_machine_set_params(&params(), &Provider::Aws(AwsProvider)).unwrap();
        let types: Vec<_> = alternatives
            .iter()
            .map(|p| p.provider_spec.value.as_ref().unwrap()["instanceType"].clone())
            .collect();
        assert_eq!(types, vec![json!("c5.xlarge"), json!("c5a.xlarge"), json!("m5.xlarge")]);
        assert!(alternatives.iter().all(|p| p.labels == params().labels));
    }

    #[test]
    fn machine_set_selects_its_own_labels() {
        let set = machine_set_from_params(NS, &params());
        assert_eq!(set.metadata.generate_name.as_deref(), Some("ci-ln-abc12-76ef8"));
        assert_eq!(set.spec.selector.match_labels.as_ref(), Some(&params().labels));
        assert_eq!(set.spec.template.metadata.labels, params().labels);
        assert_eq!(set.spec.replicas, Some(1));
    }

    #[tokio::test]
    async fn create_posts_to_machine_api_namespace() {
        let (mock_svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("create request");
            assert_eq!(request.method(), &Method::POST);
            assert_eq!(
                request.uri().path(),
                "/apis/machine.openshift.io/v1beta1/namespaces/openshift-machine-api/machinesets"
            );
            let mut created = serde_json::to_value(machine_set_from_params(NS, &params())).unwrap();
            created["metadata"]["name"] = json!("ci-ln-abc12-76ef8-x7k2p");
            send.send_response(respond(created));
        });
        let client = Client::new(mock_svc, "default");

        let created = create_machine_set(&client, NS, &params()).await.unwrap();
        assert_eq!(created.name_any(), "ci-ln-abc12-76ef8-x7k2p");
    }

    #[tokio::test]
    async fn params_copy_the_first_worker() {
        let (mock_svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                match request.uri().path() {
                    "/apis/machine.openshift.io/v1beta1/namespaces/openshift-machine-api/machinesets" => {
                        send.send_response(respond(json!({
                            "apiVersion": "machine.openshift.io/v1beta1",
                            "kind": "MachineSetList",
                            "metadata": {},
                            "items": [
                                worker_set("infra-a", "infra", "r5.large"),
                                worker_set("workers-a", "worker", "m6i.xlarge"),
                                worker_set("workers-b", "worker", "m5.xlarge"),
                            ]
                        })));
                    }
                    "/apis/config.openshift.io/v1/infrastructures/cluster" => {
                        send.send_response(respond(json!({
                            "apiVersion": "config.openshift.io/v1",
                            "kind": "Infrastructure",
                            "metadata": { "name": "cluster" },
                            "spec": {},
                            "status": {
                                "infrastructureName": "ci-ln-abc12-76ef8",
                                "platformStatus": { "type": "AWS" }
                            }
                        })));
                    }
                    path => panic!("unexpected request: {path}"),
                }
            }
        });
        let client = Client::new(mock_svc, "default");

        let params = build_machine_set_params(&client, NS, 3).await.unwrap();

        assert_eq!(params.name, "ci-ln-abc12-76ef8");
        assert_eq!(params.replicas, 3);
        assert_eq!(
            params.provider_spec.value.as_ref().unwrap()["instanceType"],
            json!("m6i.xlarge")
        );
        assert_eq!(params.labels[CLUSTER_KEY], "ci-ln-abc12-76ef8");
        assert!(Uuid::parse_str(&params.labels[E2E_LABEL]).is_ok());
        assert_eq!(params.labels.len(), 2);
        let [taint] = params.taints.as_slice() else {
            panic!("expected one taint, got {:?}", params.taints);
        };
        assert_eq!(
            (taint.key.as_str(), taint.effect.as_str()),
            (ACTUATOR_PKG_TAINT, "PreferNoSchedule")
        );
    }

    #[tokio::test]
    async fn deletion_stops_at_the_first_error() {
        let (mock_svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_inner = deleted.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                assert_eq!(request.method(), &Method::DELETE);
                let name = request.uri().path().rsplit('/').next().unwrap().to_string();
                deleted_inner.lock().unwrap().push(name.clone());
                if name == "set-b" {
                    send.send_response(
                        Response::builder()
                            .status(403)
                            .header("content-type", "application/json")
                            .body(Body::from(
                                serde_json::to_vec(&json!({
                                    "kind": "Status",
                                    "apiVersion": "v1",
                                    "metadata": {},
                                    "status": "Failure",
                                    "message": "forbidden",
                                    "reason": "Forbidden",
                                    "code": 403
                                }))
                                .unwrap(),
                            ))
                            .unwrap(),
                    );
                } else {
                    send.send_response(respond(worker_set(&name, "worker", "m6i.xlarge")));
                }
            }
        });
        let client = Client::new(mock_svc, "default");
        let sets: Vec<MachineSet> = ["set-a", "set-b", "set-c"]
            .iter()
            .map(|name| serde_json::from_value(worker_set(name, "worker", "m6i.xlarge")).unwrap())
            .collect();

        let err = delete_machine_sets(&client, &sets).await.unwrap_err();

        assert!(matches!(err, MachineError::Kube(_)), "{err:?}");
        assert_eq!(*deleted.lock().unwrap(), vec!["set-a", "set-b"]);
    }

    #[tokio::test]
    async fn deletion_deletes_every_set() {
        let (mock_svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_inner = deleted.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                assert_eq!(request.method(), &Method::DELETE);
                assert!(request.uri().path().starts_with(
                    "/apis/machine.openshift.io/v1beta1/namespaces/openshift-machine-api/machinesets/"
                ));
                let name = request.uri().path().rsplit('/').next().unwrap().to_string();
                deleted_inner.lock().unwrap().push(name.clone());
                send.send_response(respond(worker_set(&name, "worker", "m6i.xlarge")));
            }
        });
        let client = Client::new(mock_svc, "default");
        let sets: Vec<MachineSet> = ["set-a", "set-b"]
            .iter()
            .map(|name| serde_json::from_value(worker_set(name, "worker", "m6i.xlarge")).unwrap())
            .collect();

        delete_machine_sets(&client, &sets).await.unwrap();
        assert_eq!(*deleted.lock().unwrap(), vec!["set-a", "set-b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_wait_reports_insufficient_capacity() {
        let client = spawn_spot_api(spot_machine(json!({
            "phase": "Provisioning",
            "providerStatus": {
                "conditions": [{
                    "type": "MachineCreation",
                    "status": "False",
                    "message": "InsufficientInstanceCapacity: no spot capacity"
                }]
            }
        })));

        let err = wait_for_spot_machine_set(
            &client,
            &WaitContext::background(),
            &spot_timeouts(),
            &Provider::Aws(AwsProvider),
            NS,
            "spot",
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, MachineError::InsufficientCapacity(ref machine) if machine == "spot-a"),
            "{err:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spot_wait_stops_on_failed_machine() {
        let client = spawn_spot_api(spot_machine(json!({
            "phase": "Failed",
            "errorReason": "InvalidConfiguration",
            "errorMessage": "bad instance type"
        })));

        let err = wait_for_spot_machine_set(
            &client,
            &WaitContext::background(),
            &spot_timeouts(),
            &Provider::Aws(AwsProvider),
            NS,
            "spot",
        )
        .await
        .unwrap_err();

        let MachineError::Wait(WaitError::StoppedTrying { attempts, message }) = err else {
            panic!("expected the wait to stop, got {err:?}");
        };
        assert_eq!(attempts, 1);
        assert_eq!(message, "found 1 Machines in failed phase");
    }
}
