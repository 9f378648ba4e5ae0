//! Operator settings from flags and environment

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Registration agent image used when an agent does not set one
pub const DEFAULT_REGISTRATION_IMAGE: &str = "quay.io/tether/registration:latest";

/// Work agent image used when an agent does not set one
pub const DEFAULT_WORK_IMAGE: &str = "quay.io/tether/work:latest";

/// Controller settings
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Seconds between periodic reconciles of each agent
    #[arg(
        long = "resync-interval",
        env = "TETHER_RESYNC_SECS",
        value_name = "SECS",
        default_value_t = 30
    )]
    pub resync_secs: u64,

    /// Deadline in seconds for one health probe run
    #[arg(
        long = "probe-timeout",
        env = "TETHER_PROBE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60
    )]
    pub probe_timeout_secs: u64,

    /// Kubeconfig for the local cluster (in-cluster config when unset)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Default registration agent image
    #[arg(long, env = "TETHER_REGISTRATION_IMAGE", default_value = DEFAULT_REGISTRATION_IMAGE)]
    pub registration_image: String,

    /// Default work agent image
    #[arg(long, env = "TETHER_WORK_IMAGE", default_value = DEFAULT_WORK_IMAGE)]
    pub work_image: String,
}

impl OperatorConfig {
    /// Periodic requeue interval
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// Deadline for one health probe run
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resync_secs: 30,
            probe_timeout_secs: 60,
            kubeconfig: None,
            registration_image: DEFAULT_REGISTRATION_IMAGE.to_string(),
            work_image: DEFAULT_WORK_IMAGE.to_string(),
        }
    }
}
