use std::time::Duration;

use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Timeouts;
use crate::poll::{AttemptError, Eventually, WaitContext, WaitError};

pub const MACHINE_API_OPERATOR: &str = "machine-api";

/// Cluster operator status (`config.openshift.io/v1`).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "config.openshift.io", version = "v1", kind = "ClusterOperator")]
#[kube(status = "ClusterOperatorStatus")]
pub struct ClusterOperatorSpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ClusterOperatorStatus {
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl ClusterOperator {
    fn condition(&self, type_: &str) -> Option<&OperatorCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// Why the operator is not settled, or `None` when it is Available,
    /// not Progressing and not Degraded. Missing conditions do not count
    /// against it.
    pub fn unavailable_reason(&self) -> Option<String> {
        let mut problems = Vec::new();
        let mut describe = |type_: &str, bad_status: &str| {
            if let Some(c) = self.condition(type_).filter(|c| c.status == bad_status) {
                problems.push(format!(
                    "{type_}={} ({})",
                    c.status,
                    c.message.as_deref().unwrap_or("no message")
                ));
            }
        };
        describe("Available", "False");
        describe("Progressing", "True");
        describe("Degraded", "True");

        if problems.is_empty() {
            None
        } else {
            Some(problems.join(", "))
        }
    }

    pub fn is_available(&self) -> bool {
        self.unavailable_reason().is_none()
    }
}

/// Wait up to `timeout` until the named ClusterOperator is available. API
/// errors are retried.
///
/// Callers usually pick one of `timeouts.wait_short`, `wait_medium` or
/// `wait_over_long`, depending on how much the operator has to roll out.
pub async fn wait_for_status_available(
    client: &Client,
    ctx: &WaitContext,
    timeouts: &Timeouts,
    timeout: Duration,
    name: &str,
) -> Result<(), WaitError> {
    let api: Api<ClusterOperator> = Api::all(client.clone());
    Eventually::new(ctx)
        .timeout(timeout)
        .poll_interval(timeouts.retry_medium)
        .describe("cluster operator available")
        .until(async |_| -> Result<(), AttemptError> {
            let operator = api.get(name).await.map_err(|error| {
                AttemptError::retry(format!("error querying api for ClusterOperator {name}: {error}"))
            })?;
            match operator.unavailable_reason() {
                None => Ok(()),
                Some(reason) => Err(AttemptError::retry(format!("{name}: {reason}"))),
            }
        })
        .await?;
    info!(operator = name, "cluster operator available");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::{Request, Response};
    use kube::client::Body;
    use serde_json::json;

    fn operator(conditions: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "config.openshift.io/v1",
            "kind": "ClusterOperator",
            "metadata": { "name": MACHINE_API_OPERATOR },
            "spec": {},
            "status": { "conditions": conditions }
        })
    }

    fn parse(conditions: serde_json::Value) -> ClusterOperator {
        serde_json::from_value(operator(conditions)).unwrap()
    }

    #[test]
    fn availability_rules() {
        let settled = parse(json!([
            { "type": "Available", "status": "True" },
            { "type": "Progressing", "status": "False" },
            { "type": "Degraded", "status": "False" }
        ]));
        assert!(settled.is_available());

        let progressing = parse(json!([
            { "type": "Available", "status": "True" },
            { "type": "Progressing", "status": "True", "message": "rolling out" }
        ]));
        assert_eq!(
            progressing.unavailable_reason().as_deref(),
            Some("Progressing=True (rolling out)")
        );

        let broken = parse(json!([
            { "type": "Available", "status": "False" },
            { "type": "Degraded", "status": "True", "message": "webhook down" }
        ]));
        assert_eq!(
            broken.unavailable_reason().as_deref(),
            Some("Available=False (no message), Degraded=True (webhook down)")
        );

        assert!(parse(json!([])).is_available());
    }

    /// Reports Progressing=True for the first `progressing_for` requests.
    fn spawn_operator_api(progressing_for: usize) -> (Client, Arc<AtomicUsize>) {
        let (mock_svc, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                assert_eq!(
                    request.uri().path(),
                    "/apis/config.openshift.io/v1/clusteroperators/machine-api"
                );
                let progressing = calls_inner.fetch_add(1, Ordering::SeqCst) < progressing_for;
                let body = operator(json!([
                    { "type": "Available", "status": "True" },
                    { "type": "Progressing", "status": if progressing { "True" } else { "False" } }
                ]));
                send.send_response(
                    Response::builder()
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                );
            }
        });
        (Client::new(mock_svc, "default"), calls)
    }

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            retry_medium: Duration::from_millis(100),
            ..Timeouts::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_operator_settles() {
        let (client, calls) = spawn_operator_api(2);

        wait_for_status_available(
            &client,
            &WaitContext::background(),
            &fast_timeouts(),
            Duration::from_secs(1),
            MACHINE_API_OPERATOR,
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_requested_timeout() {
        let (client, calls) = spawn_operator_api(usize::MAX);

        let started = tokio::time::Instant::now();
        let err = wait_for_status_available(
            &client,
            &WaitContext::background(),
            &fast_timeouts(),
            Duration::from_secs(1),
            MACHINE_API_OPERATOR,
        )
        .await
        .unwrap_err();

        assert!(err.is_cancellation(), "{err:?}");
        assert!(err.to_string().contains("Progressing=True"), "{err}");
        assert!(started.elapsed() <= Duration::from_millis(1100));
        assert!((9..=11).contains(&calls.load(Ordering::SeqCst)));
    }
}
