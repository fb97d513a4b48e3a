use serde_json::{Value, json};

use crate::providers::provider::{PROVIDER_SPEC_API_VERSION, ProviderError, string_at, with_string_field};

/// GCP `GCPMachineProviderSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcpProvider;

impl GcpProvider {
    pub const NAME: &'static str = "GCP";
    pub const DEFAULT_MACHINE_TYPE: &'static str = "n1-standard-4";

    pub fn minimal_spec(&self) -> Value {
        json!({
            "apiVersion": PROVIDER_SPEC_API_VERSION,
            "kind": "GCPMachineProviderSpec",
            "machineType": Self::DEFAULT_MACHINE_TYPE,
        })
    }

    pub fn with_instance_type(&self, base: &Value, machine_type: &str) -> Result<Value, ProviderError> {
        with_string_field(base, "machineType", machine_type)
    }

    pub fn zone(&self, spec: &Value) -> Option<String> {
        string_at(spec, "/zone")
    }
}
