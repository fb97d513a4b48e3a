use serde_json::{Value, json};

use crate::providers::provider::PROVIDER_SPEC_API_VERSION;

/// vSphere `VSphereMachineProviderSpec`. Sizing is numeric, so there is no
/// instance type to swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VSphereProvider;

impl VSphereProvider {
    pub const NAME: &'static str = "vSphere";

    pub fn minimal_spec(&self) -> Value {
        json!({
            "apiVersion": PROVIDER_SPEC_API_VERSION,
            "kind": "VSphereMachineProviderSpec",
            "numCPUs": 4,
            "memoryMiB": 16384,
            "diskGiB": 120,
        })
    }
}
