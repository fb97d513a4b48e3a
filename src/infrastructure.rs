use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Name of the cluster-wide Infrastructure object.
pub const GLOBAL_INFRASTRUCTURE_NAME: &str = "cluster";

/// Cluster-wide infrastructure configuration (`config.openshift.io/v1`).
///
/// Only the status fields the suite reads are modelled.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "config.openshift.io", version = "v1", kind = "Infrastructure")]
#[kube(status = "InfrastructureStatus")]
pub struct InfrastructureSpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Unique name given to the cluster's cloud resources, e.g. "ci-ln-4q2cbq2-76ef8".
    #[serde(default)]
    pub infrastructure_name: String,
    #[serde(rename = "apiServerURL", default)]
    pub api_server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_status: Option<PlatformStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PlatformStatus {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("platform status is not populated in infrastructure object")]
    MissingPlatformStatus,

    #[error("infrastructure name is empty in infrastructure status")]
    MissingInfrastructureName,

    #[error("failed to parse the API server URL {url:?}: {source}")]
    InvalidApiServerUrl {
        url: String,
        source: http::uri::InvalidUri,
    },

    #[error("API server URL {url:?} has no host")]
    MissingHost { url: String },

    #[error("API server URL {url:?} has no port (host {host})")]
    MissingPort { url: String, host: String },
}

/// The platform a cluster runs on, as reported by the Infrastructure object.
///
/// Resolved once per suite with [`resolve_platform`] and passed to whatever
/// needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    Aws,
    Azure,
    Gcp,
    VSphere,
    OpenStack,
    BareMetal,
    IbmCloud,
    Nutanix,
    PowerVs,
    External,
    None,
    /// A platform type this crate does not know about.
    Other(String),
}

impl Platform {
    /// Parse the `status.platformStatus.type` string.
    pub fn from_type(platform_type: &str) -> Self {
        match platform_type {
            "AWS" => Self::Aws,
            "Azure" => Self::Azure,
            "GCP" => Self::Gcp,
            "VSphere" => Self::VSphere,
            "OpenStack" => Self::OpenStack,
            "BareMetal" => Self::BareMetal,
            "IBMCloud" => Self::IbmCloud,
            "Nutanix" => Self::Nutanix,
            "PowerVS" => Self::PowerVs,
            "External" => Self::External,
            "None" => Self::None,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Gcp => "GCP",
            Self::VSphere => "VSphere",
            Self::OpenStack => "OpenStack",
            Self::BareMetal => "BareMetal",
            Self::IbmCloud => "IBMCloud",
            Self::Nutanix => "Nutanix",
            Self::PowerVs => "PowerVS",
            Self::External => "External",
            Self::None => "None",
            Self::Other(other) => other,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetch the global Infrastructure object.
pub async fn get_infrastructure(client: &Client) -> Result<Infrastructure, InfrastructureError> {
    let api: Api<Infrastructure> = Api::all(client.clone());
    Ok(api.get(GLOBAL_INFRASTRUCTURE_NAME).await?)
}

/// Read the cluster platform from the Infrastructure object.
pub async fn resolve_platform(client: &Client) -> Result<Platform, InfrastructureError> {
    let infra = get_infrastructure(client).await?;
    let platform = platform_of(&infra)?;
    info!(%platform, "resolved cluster platform");
    Ok(platform)
}

pub fn platform_of(infra: &Infrastructure) -> Result<Platform, InfrastructureError> {
    infra
        .status
        .as_ref()
        .and_then(|s| s.platform_status.as_ref())
        .map(|ps| Platform::from_type(&ps.type_))
        .ok_or(InfrastructureError::MissingPlatformStatus)
}

/// The non-empty infrastructure name used to prefix cloud resources.
pub async fn infrastructure_name(client: &Client) -> Result<String, InfrastructureError> {
    let infra = get_infrastructure(client).await?;
    infra
        .status
        .map(|s| s.infrastructure_name)
        .filter(|name| !name.is_empty())
        .ok_or(InfrastructureError::MissingInfrastructureName)
}

/// Host and port of the control plane endpoint from `status.apiServerURL`.
pub async fn control_plane_host_and_port(
    client: &Client,
) -> Result<(String, u16), InfrastructureError> {
    let infra = get_infrastructure(client).await?;
    let url = infra.status.map(|s| s.api_server_url).unwrap_or_default();
    parse_host_and_port(&url)
}

fn parse_host_and_port(url: &str) -> Result<(String, u16), InfrastructureError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|source| InfrastructureError::InvalidApiServerUrl {
            url: url.to_string(),
            source,
        })?;
    let host = uri
        .host()
        .ok_or_else(|| InfrastructureError::MissingHost {
            url: url.to_string(),
        })?
        .to_string();
    match uri.port_u16() {
        Some(port) => Ok((host, port)),
        None => Err(InfrastructureError::MissingPort {
            url: url.to_string(),
            host,
        }),
    }
}
