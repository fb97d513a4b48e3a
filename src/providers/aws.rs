use serde_json::{Value, json};

use crate::providers::provider::{PROVIDER_SPEC_API_VERSION, ProviderError, string_at, with_string_field};

/// AWS `AWSMachineProviderConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AwsProvider;

impl AwsProvider {
    pub const NAME: &'static str = "AWS";
    pub const DEFAULT_INSTANCE_TYPE: &'static str = "m5.xlarge";
    /// Cheapest compute instances meeting the 4 vCPU / 8 GiB node minimum.
    pub const ALTERNATIVE_INSTANCE_TYPES: &'static [&'static str] =
        &["c5.xlarge", "c5a.xlarge", "m5.xlarge"];
    pub const INSUFFICIENT_CAPACITY: &'static str = "InsufficientInstanceCapacity";

    pub fn minimal_spec(&self) -> Value {
        json!({
            "apiVersion": PROVIDER_SPEC_API_VERSION,
            "kind": "AWSMachineProviderConfig",
            "instanceType": Self::DEFAULT_INSTANCE_TYPE,
        })
    }

    pub fn with_instance_type(&self, base: &Value, instance_type: &str) -> Result<Value, ProviderError> {
        with_string_field(base, "instanceType", instance_type)
    }

    pub fn zone(&self, spec: &Value) -> Option<String> {
        string_at(spec, "/placement/availabilityZone")
    }
}
