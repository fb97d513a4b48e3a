use serde_json::{Value, json};

use crate::providers::provider::{PROVIDER_SPEC_API_VERSION, ProviderError, string_at, with_string_field};

/// Azure `AzureMachineProviderSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AzureProvider;

impl AzureProvider {
    pub const NAME: &'static str = "Azure";
    pub const DEFAULT_VM_SIZE: &'static str = "Standard_D4s_v3";
    pub const ALTERNATIVE_VM_SIZES: &'static [&'static str] =
        &["Standard_F4s_v2", "Standard_D4as_v5", "Standard_D4as_v4"];
    pub const INSUFFICIENT_CAPACITY: &'static str = "SkuNotAvailable";

    pub fn minimal_spec(&self) -> Value {
        json!({
            "apiVersion": PROVIDER_SPEC_API_VERSION,
            "kind": "AzureMachineProviderSpec",
            "vmSize": Self::DEFAULT_VM_SIZE,
        })
    }

    pub fn with_instance_type(&self, base: &Value, vm_size: &str) -> Result<Value, ProviderError> {
        with_string_field(base, "vmSize", vm_size)
    }

    pub fn zone(&self, spec: &Value) -> Option<String> {
        string_at(spec, "/zone")
    }
}
