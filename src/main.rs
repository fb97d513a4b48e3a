use anyhow::{Context, Result};
use envconfig::Envconfig;
use kube::ResourceExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use machine_e2e::config::SuiteConfig;
use machine_e2e::framework::Framework;
use machine_e2e::machine::{wait_for_machine_set, worker_machine_sets};
use machine_e2e::nodes::wait_until_all_nodes_ready;
use machine_e2e::operator::{MACHINE_API_OPERATOR, wait_for_status_available};
use machine_e2e::poll::WaitContext;

/// Preflight for the machine API suite: the operator is settled, every node
/// is Ready and every worker MachineSet is fully running.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SuiteConfig::init_from_env().context("reading suite configuration")?;
    let framework = Framework::connect(config).await?;
    let client = &framework.client;
    let timeouts = &framework.timeouts;
    let namespace = framework.machine_api_namespace();

    let ctx = WaitContext::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling waits");
            interrupt.cancel();
        }
    });

    match framework.provider() {
        Ok(provider) => info!(provider = provider.name(), "provider-specific checks available"),
        Err(error) => warn!(%error, "no provider-specific checks for this platform"),
    }

    wait_for_status_available(
        client,
        &ctx,
        timeouts,
        timeouts.wait_over_long,
        MACHINE_API_OPERATOR,
    )
        .await
        .context("machine-api operator is not available")?;
    wait_until_all_nodes_ready(client, &ctx, timeouts)
        .await
        .context("nodes are not ready")?;

    let workers = worker_machine_sets(client, namespace).await?;
    for machine_set in &workers {
        let name = machine_set.name_any();
        wait_for_machine_set(client, &ctx, timeouts, namespace, &name)
            .await
            .with_context(|| format!("worker machine set {name} is not running"))?;
    }

    info!(machine_sets = workers.len(), "preflight passed");
    Ok(())
}
