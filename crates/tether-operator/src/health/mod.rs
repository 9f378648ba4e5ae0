//! Hub credential health checks
//!
//! Each credential secret is walked through a fixed sequence: read the secret,
//! build a client from its kubeconfig, then ask the hub a list of
//! SelfSubjectAccessReviews. The first failure ends the walk. The hub-config
//! and bootstrap results fold into a single `HubConnectionDegraded` condition.

mod hub_client;
pub mod permissions;
mod probe;

pub use hub_client::{probe_quota, KubeHubClientFactory, KubeSecretReader, SsarReviewer};
pub use permissions::PermissionProbe;
pub use probe::{
    AccessReviewer, CredentialCheck, CredentialRole, CredentialState, HealthProbe,
    HubClientFactory, SecretReader, Unreadable, HUB_CONNECTION_DEGRADED,
    HUB_CONNECTION_FUNCTIONAL,
};

#[cfg(test)]
pub(crate) use probe::{MockAccessReviewer, MockHubClientFactory, MockSecretReader};
