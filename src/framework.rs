use kube::Client;
use tracing::info;

use crate::config::{SuiteConfig, Timeouts};
use crate::infrastructure::{InfrastructureError, Platform, resolve_platform};
use crate::providers::{Provider, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("could not build a cluster client: {0}")]
    Client(#[from] kube::Error),

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

/// What every test needs: a client, the cluster platform and the suite
/// timeouts. The platform is resolved once here and passed down.
#[derive(Clone)]
pub struct Framework {
    pub client: Client,
    pub platform: Platform,
    pub timeouts: Timeouts,
    pub config: SuiteConfig,
}

impl Framework {
    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn connect(config: SuiteConfig) -> Result<Self, FrameworkError> {
        let client = Client::try_default().await?;
        Self::with_client(client, config).await
    }

    pub async fn with_client(client: Client, config: SuiteConfig) -> Result<Self, FrameworkError> {
        let platform = resolve_platform(&client).await?;
        info!(
            %platform,
            namespace = %config.machine_api_namespace,
            ci = config.is_openshift_ci(),
            "framework ready"
        );
        Ok(Self {
            client,
            platform,
            timeouts: config.timeouts(),
            config,
        })
    }

    pub fn machine_api_namespace(&self) -> &str {
        &self.config.machine_api_namespace
    }

    pub fn provider(&self) -> Result<Provider, ProviderError> {
        Provider::for_platform(&self.platform)
    }
}
