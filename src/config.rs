use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

/// Suite-wide settings read from the environment.
#[derive(Envconfig, Debug, Clone)]
pub struct SuiteConfig {
    #[envconfig(from = "E2E_MACHINE_API_NAMESPACE", default = "openshift-machine-api")]
    pub machine_api_namespace: String,

    #[envconfig(from = "E2E_CLUSTER_API_NAMESPACE", default = "openshift-cluster-api")]
    pub cluster_api_namespace: String,

    #[envconfig(from = "E2E_RETRY_SHORT_SECS", default = "1")]
    pub retry_short_secs: u64,

    #[envconfig(from = "E2E_RETRY_MEDIUM_SECS", default = "5")]
    pub retry_medium_secs: u64,

    #[envconfig(from = "E2E_WAIT_SHORT_SECS", default = "60")]
    pub wait_short_secs: u64,

    #[envconfig(from = "E2E_WAIT_MEDIUM_SECS", default = "180")]
    pub wait_medium_secs: u64,

    #[envconfig(from = "E2E_WAIT_OVER_MEDIUM_SECS", default = "300")]
    pub wait_over_medium_secs: u64,

    #[envconfig(from = "E2E_WAIT_LONG_SECS", default = "900")]
    pub wait_long_secs: u64,

    #[envconfig(from = "E2E_WAIT_OVER_LONG_SECS", default = "1800")]
    pub wait_over_long_secs: u64,

    #[envconfig(from = "E2E_NODES_READY_SECS", default = "600")]
    pub nodes_ready_secs: u64,

    /// Set to `"true"` by OpenShift CI.
    #[envconfig(from = "OPENSHIFT_CI", default = "")]
    pub openshift_ci: String,

    #[envconfig(from = "ARTIFACT_DIR")]
    pub artifact_dir: Option<String>,
}

/// Poll intervals and deadlines used by the wait helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub retry_short: Duration,
    pub retry_medium: Duration,
    pub wait_short: Duration,
    pub wait_medium: Duration,
    pub wait_over_medium: Duration,
    pub wait_long: Duration,
    pub wait_over_long: Duration,
    pub nodes_ready: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            retry_short: Duration::from_secs(1),
            retry_medium: Duration::from_secs(5),
            wait_short: Duration::from_secs(60),
            wait_medium: Duration::from_secs(3 * 60),
            wait_over_medium: Duration::from_secs(5 * 60),
            wait_long: Duration::from_secs(15 * 60),
            wait_over_long: Duration::from_secs(30 * 60),
            nodes_ready: Duration::from_secs(10 * 60),
        }
    }
}

impl SuiteConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            retry_short: Duration::from_secs(self.retry_short_secs),
            retry_medium: Duration::from_secs(self.retry_medium_secs),
            wait_short: Duration::from_secs(self.wait_short_secs),
            wait_medium: Duration::from_secs(self.wait_medium_secs),
            wait_over_medium: Duration::from_secs(self.wait_over_medium_secs),
            wait_long: Duration::from_secs(self.wait_long_secs),
            wait_over_long: Duration::from_secs(self.wait_over_long_secs),
            nodes_ready: Duration::from_secs(self.nodes_ready_secs),
        }
    }

    /// OpenShift CI is detected by `OPENSHIFT_CI=true` plus a non-empty
    /// `ARTIFACT_DIR`.
    pub fn is_openshift_ci(&self) -> bool {
        self.openshift_ci == "true"
            && self
                .artifact_dir
                .as_deref()
                .is_some_and(|dir| !dir.is_empty())
    }

    /// Where suite artifacts go: `$ARTIFACT_DIR/machine-api-e2e-suite` in CI,
    /// `./_out` otherwise.
    pub fn output_dir(&self) -> std::io::Result<PathBuf> {
        match self.artifact_dir.as_deref() {
            Some(dir) if self.is_openshift_ci() => {
                Ok(PathBuf::from(dir).join("machine-api-e2e-suite"))
            }
            _ => Ok(std::env::current_dir()?.join("_out")),
        }
    }
}
