pub mod aws;
pub mod azure;
pub mod gcp;
pub mod provider;
pub mod vsphere;

pub use provider::{Provider, ProviderError};
