use serde::Deserialize;
use serde_json::Value;

use crate::infrastructure::Platform;
use crate::providers::aws::AwsProvider;
use crate::providers::azure::AzureProvider;
use crate::providers::gcp::GcpProvider;
use crate::providers::vsphere::VSphereProvider;

pub const PROVIDER_SPEC_API_VERSION: &str = "machine.openshift.io/v1beta1";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No provider table exists for the cluster platform.
    #[error("platform {0} is not supported")]
    UnsupportedPlatform(Platform),

    /// The provider exists but does not implement this operation.
    #[error("{operation} is not implemented for {provider}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("providerSpec value is not a JSON object")]
    NotAnObject,

    #[error("malformed provider status: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cloud-specific knowledge about Machine providerSpecs, one variant per
/// supported platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Aws(AwsProvider),
    Azure(AzureProvider),
    Gcp(GcpProvider),
    VSphere(VSphereProvider),
}

impl Provider {
    pub fn for_platform(platform: &Platform) -> Result<Self, ProviderError> {
        match platform {
            Platform::Aws => Ok(Self::Aws(AwsProvider)),
            Platform::Azure => Ok(Self::Azure(AzureProvider)),
            Platform::Gcp => Ok(Self::Gcp(GcpProvider)),
            Platform::VSphere => Ok(Self::VSphere(VSphereProvider)),
            other => Err(ProviderError::UnsupportedPlatform(other.clone())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aws(_) => AwsProvider::NAME,
            Self::Azure(_) => AzureProvider::NAME,
            Self::Gcp(_) => GcpProvider::NAME,
            Self::VSphere(_) => VSphereProvider::NAME,
        }
    }

    /// Smallest providerSpec value the platform's machine controller accepts.
    pub fn build_minimal_spec(&self) -> Value {
        match self {
            Self::Aws(p) => p.minimal_spec(),
            Self::Azure(p) => p.minimal_spec(),
            Self::Gcp(p) => p.minimal_spec(),
            Self::VSphere(p) => p.minimal_spec(),
        }
    }

    /// Copy of `base` with its instance type (VM size, machine type)
    /// replaced. Every other field is preserved.
    pub fn build_template(&self, base: &Value, instance_type: &str) -> Result<Value, ProviderError> {
        match self {
            Self::Aws(p) => p.with_instance_type(base, instance_type),
            Self::Azure(p) => p.with_instance_type(base, instance_type),
            Self::Gcp(p) => p.with_instance_type(base, instance_type),
            Self::VSphere(_) => Err(self.unsupported("build_template")),
        }
    }

    /// Availability zone a providerSpec places machines in.
    pub fn default_zone(&self, spec: &Value) -> Option<String> {
        match self {
            Self::Aws(p) => p.zone(spec),
            Self::Azure(p) => p.zone(spec),
            Self::Gcp(p) => p.zone(spec),
            Self::VSphere(_) => None,
        }
    }

    /// Instance types to fall back on when the default one lacks capacity.
    pub fn alternative_instance_types(&self) -> Result<&'static [&'static str], ProviderError> {
        match self {
            Self::Aws(_) => Ok(AwsProvider::ALTERNATIVE_INSTANCE_TYPES),
            Self::Azure(_) => Ok(AzureProvider::ALTERNATIVE_VM_SIZES),
            _ => Err(self.unsupported("alternative instance types")),
        }
    }

    /// Whether a Machine's `status.providerStatus` reports that the cloud ran
    /// out of capacity for it. A missing status is not a capacity failure.
    pub fn has_insufficient_capacity(
        &self,
        provider_status: Option<&Value>,
    ) -> Result<bool, ProviderError> {
        let marker = match self {
            Self::Aws(_) => AwsProvider::INSUFFICIENT_CAPACITY,
            Self::Azure(_) => AzureProvider::INSUFFICIENT_CAPACITY,
            _ => return Err(self.unsupported("insufficient capacity detection")),
        };
        let Some(status) = provider_status else {
            return Ok(false);
        };
        creation_failed_with(status, marker)
    }

    fn unsupported(&self, operation: &'static str) -> ProviderError {
        ProviderError::Unsupported {
            provider: self.name(),
            operation,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProviderStatus {
    #[serde(default)]
    conditions: Vec<StatusCondition>,
}

#[derive(Debug, Deserialize)]
struct StatusCondition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
    #[serde(default)]
    message: String,
}

/// True when the first False `MachineCreation`/`MachineCreated` condition
/// mentions `marker`.
fn creation_failed_with(status: &Value, marker: &str) -> Result<bool, ProviderError> {
    let status = ProviderStatus::deserialize(status)?;
    Ok(status
        .conditions
        .iter()
        .find(|c| {
            (c.type_ == "MachineCreation" || c.type_ == "MachineCreated") && c.status == "False"
        })
        .is_some_and(|c| c.message.contains(marker)))
}

/// Clone `spec` and set a top-level string field.
pub(crate) fn with_string_field(spec: &Value, field: &str, value: &str) -> Result<Value, ProviderError> {
    let mut spec = spec.clone();
    spec.as_object_mut()
        .ok_or(ProviderError::NotAnObject)?
        .insert(field.to_string(), Value::String(value.to_string()));
    Ok(spec)
}

/// Non-empty string at a JSON pointer.
pub(crate) fn string_at(spec: &Value, pointer: &str) -> Option<String> {
    spec.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
