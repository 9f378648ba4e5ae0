//! Credential checks and the composite hub connection condition

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::config::Kubeconfig;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use tether_common::conditions::{Condition, ConditionStatus};
use tether_common::kube_utils::{load_kubeconfig_from_secret, secret_data};
use tether_common::{
    Error, BOOTSTRAP_KUBECONFIG_SECRET, CLUSTER_NAME_KEY, HUB_KUBECONFIG_SECRET, KUBECONFIG_KEY,
};

use super::permissions::{bootstrap_probes, hub_config_probes, PermissionProbe};

/// Condition type written for the hub connection (`True` means degraded)
pub const HUB_CONNECTION_DEGRADED: &str = "HubConnectionDegraded";

/// Reason on a healthy hub connection
pub const HUB_CONNECTION_FUNCTIONAL: &str = "HubConnectionFunctional";

/// Reads credential secrets from the local cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Fetch a secret, `Ok(None)` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
}

/// Answers permission checks as the identity of one credential
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether the identity may perform the probed operation
    async fn review(&self, probe: &PermissionProbe) -> Result<bool, Error>;
}

/// Builds a rate-limited hub client from a credential's kubeconfig
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HubClientFactory: Send + Sync {
    /// Build a reviewer authenticated with `kubeconfig`
    async fn connect(&self, kubeconfig: Kubeconfig) -> Result<Arc<dyn AccessReviewer>, Error>;
}

/// Which credential is being checked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialRole {
    /// Used only to register and obtain the hub-config credential
    Bootstrap,
    /// The credential agents use to talk to the hub
    HubConfig,
}

impl CredentialRole {
    /// Name of the secret holding this credential
    pub fn secret_name(&self) -> &'static str {
        match self {
            Self::Bootstrap => BOOTSTRAP_KUBECONFIG_SECRET,
            Self::HubConfig => HUB_KUBECONFIG_SECRET,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap secret",
            Self::HubConfig => "hub config secret",
        }
    }
}

/// Why a credential secret could not be turned into a client
#[derive(Clone, Debug, PartialEq)]
pub enum Unreadable {
    /// The secret has no `kubeconfig` key
    KubeconfigMissing,
    /// No cluster name on the agent and no `cluster-name` key in the secret
    ClusterNameMissing,
    /// The kubeconfig did not parse or the client could not be built
    Invalid(String),
}

/// Terminal state of one credential check
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialState {
    /// The secret could not be read
    Missing {
        /// Read failure, or the not-found message
        error: String,
    },
    /// The secret exists but does not yield a client
    Unreadable(Unreadable),
    /// A permission check was denied
    Unauthorized(PermissionProbe),
    /// A permission check failed to complete
    ProbeError {
        /// The check that failed
        probe: PermissionProbe,
        /// Why it failed
        error: String,
    },
    /// Every permission check passed
    Functional,
}

/// Outcome of checking one credential secret
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialCheck {
    /// Credential that was checked
    pub role: CredentialRole,
    /// Namespace of the secret
    pub namespace: String,
    /// Where the check stopped
    pub state: CredentialState,
}

impl CredentialCheck {
    /// Whether the credential grants everything it needs
    pub fn is_functional(&self) -> bool {
        self.state == CredentialState::Functional
    }

    /// Machine-readable reason for this outcome
    pub fn reason(&self) -> &'static str {
        use CredentialRole::{Bootstrap, HubConfig};
        match (self.role, &self.state) {
            (Bootstrap, CredentialState::Missing { .. }) => "BootstrapSecretMissing",
            (Bootstrap, CredentialState::Unreadable(_) | CredentialState::ProbeError { .. }) => {
                "BootstrapSecretError"
            }
            (Bootstrap, CredentialState::Unauthorized(_)) => "BootstrapSecretUnauthorized",
            (Bootstrap, CredentialState::Functional) => "BootstrapSecretFunctional",
            (HubConfig, CredentialState::Missing { .. }) => "HubKubeConfigSecretMissing",
            (HubConfig, CredentialState::Unreadable(Unreadable::KubeconfigMissing)) => {
                "HubKubeConfigMissing"
            }
            (HubConfig, CredentialState::Unreadable(Unreadable::ClusterNameMissing)) => {
                "ClusterNameMissing"
            }
            (HubConfig, CredentialState::Unreadable(_) | CredentialState::ProbeError { .. }) => {
                "HubKubeConfigError"
            }
            (HubConfig, CredentialState::Unauthorized(_)) => "HubKubeConfigUnauthorized",
            (HubConfig, CredentialState::Functional) => "HubConfigSecretFunctional",
        }
    }

    /// Human-readable description of this outcome
    pub fn message(&self) -> String {
        let name = self.role.secret_name();
        let ns = self.namespace.as_str();
        let label = self.role.label();
        match (&self.state, self.role) {
            (CredentialState::Functional, CredentialRole::Bootstrap) => {
                "BootstrapSecret is functioning correctly".to_string()
            }
            (CredentialState::Functional, CredentialRole::HubConfig) => {
                "HubConfigSecret is functioning correctly".to_string()
            }
            (CredentialState::Missing { error }, _) => {
                format!("Failed to get {label} {ns:?} {name:?}: {error}")
            }
            (CredentialState::Unreadable(Unreadable::KubeconfigMissing), CredentialRole::HubConfig) => {
                format!(
                    "Failed to get kubeconfig from `kubectl get secret -n {ns} {name} -ojsonpath='{{.data.{KUBECONFIG_KEY}}}'`. \
                     It is written by the registration agent once its certificate signing request is approved on the hub."
                )
            }
            (CredentialState::Unreadable(Unreadable::KubeconfigMissing), CredentialRole::Bootstrap) => {
                format!(
                    "Failed to build kube client with {label} {ns:?} {name:?}: unable to find kubeconfig in secret {ns:?} {name:?}"
                )
            }
            (CredentialState::Unreadable(Unreadable::ClusterNameMissing), _) => {
                format!(
                    "Failed to get cluster name from `kubectl get secret -n {ns} {name} -ojsonpath='{{.data.{CLUSTER_NAME_KEY}}}'`. \
                     It is written by the registration agent once the cluster is accepted on the hub."
                )
            }
            (CredentialState::Unreadable(Unreadable::Invalid(error)), _) => {
                format!("Failed to build kube client with {label} {ns:?} {name:?}: {error}")
            }
            (CredentialState::ProbeError { probe, error }, _) => {
                format!(
                    "Failed to create SelfSubjectAccessReview for {probe} with {label} {ns:?} {name:?}: {error}"
                )
            }
            (CredentialState::Unauthorized(probe), _) => {
                format!("Operation for resource {probe} is not allowed with {label} {ns:?} {name:?}")
            }
        }
    }
}

/// Runs credential checks against the hub
pub struct HealthProbe {
    secrets: Arc<dyn SecretReader>,
    clients: Arc<dyn HubClientFactory>,
}

impl HealthProbe {
    /// Create a probe over the given secret reader and client factory
    pub fn new(secrets: Arc<dyn SecretReader>, clients: Arc<dyn HubClientFactory>) -> Self {
        Self { secrets, clients }
    }

    /// Check the bootstrap credential in `namespace`
    pub async fn check_bootstrap(&self, namespace: &str) -> CredentialCheck {
        let role = CredentialRole::Bootstrap;
        let state = match self.read_secret(role, namespace).await {
            Err(state) => state,
            Ok(secret) => match self.connect(&secret).await {
                Err(state) => state,
                Ok(reviewer) => run_probes(reviewer.as_ref(), &bootstrap_probes()).await,
            },
        };
        self.finish(role, namespace, state)
    }

    /// Check the hub-config credential in `namespace`.
    ///
    /// `cluster_name` wins over the secret's `cluster-name` key.
    pub async fn check_hub_config(
        &self,
        namespace: &str,
        cluster_name: Option<&str>,
    ) -> CredentialCheck {
        let role = CredentialRole::HubConfig;
        let state = match self.hub_config_state(namespace, cluster_name).await {
            Ok(state) | Err(state) => state,
        };
        self.finish(role, namespace, state)
    }

    async fn hub_config_state(
        &self,
        namespace: &str,
        cluster_name: Option<&str>,
    ) -> Result<CredentialState, CredentialState> {
        let secret = self.read_secret(CredentialRole::HubConfig, namespace).await?;
        if secret_data(&secret, KUBECONFIG_KEY).is_none() {
            return Err(CredentialState::Unreadable(Unreadable::KubeconfigMissing));
        }
        let reviewer = self.connect(&secret).await?;

        let cluster = match cluster_name.filter(|c| !c.is_empty()) {
            Some(cluster) => cluster.to_string(),
            None => secret_data(&secret, CLUSTER_NAME_KEY)
                .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
                .filter(|c| !c.is_empty())
                .ok_or(CredentialState::Unreadable(Unreadable::ClusterNameMissing))?,
        };

        Ok(run_probes(reviewer.as_ref(), &hub_config_probes(&cluster)).await)
    }

    /// Evaluate the hub connection for an agent running in `namespace`.
    ///
    /// The bootstrap credential is only checked when the hub-config credential
    /// is not functional. Any hub-config failure degrades the connection, even
    /// when bootstrap is healthy.
    pub async fn composite(&self, namespace: &str, cluster_name: Option<&str>) -> Condition {
        let hub = self.check_hub_config(namespace, cluster_name).await;
        if hub.is_functional() {
            return Condition::new(
                HUB_CONNECTION_DEGRADED,
                ConditionStatus::False,
                HUB_CONNECTION_FUNCTIONAL,
                "Hub connection is functioning correctly",
            );
        }

        let bootstrap = self.check_bootstrap(namespace).await;
        Condition::new(
            HUB_CONNECTION_DEGRADED,
            ConditionStatus::True,
            format!("{},{}", bootstrap.reason(), hub.reason()),
            format!("{}\n{}", bootstrap.message(), hub.message()),
        )
    }

    async fn read_secret(
        &self,
        role: CredentialRole,
        namespace: &str,
    ) -> Result<Secret, CredentialState> {
        let name = role.secret_name();
        match self.secrets.get_secret(namespace, name).await {
            Ok(Some(secret)) => Ok(secret),
            Ok(None) => Err(CredentialState::Missing {
                error: format!("secrets {name:?} not found"),
            }),
            Err(e) => Err(CredentialState::Missing {
                error: e.to_string(),
            }),
        }
    }

    async fn connect(&self, secret: &Secret) -> Result<Arc<dyn AccessReviewer>, CredentialState> {
        let kubeconfig = load_kubeconfig_from_secret(secret).map_err(|e| {
            if secret_data(secret, KUBECONFIG_KEY).is_none() {
                CredentialState::Unreadable(Unreadable::KubeconfigMissing)
            } else {
                CredentialState::Unreadable(Unreadable::Invalid(e.to_string()))
            }
        })?;
        self.clients
            .connect(kubeconfig)
            .await
            .map_err(|e| CredentialState::Unreadable(Unreadable::Invalid(e.to_string())))
    }

    fn finish(&self, role: CredentialRole, namespace: &str, state: CredentialState) -> CredentialCheck {
        let check = CredentialCheck {
            role,
            namespace: namespace.to_string(),
            state,
        };
        if check.is_functional() {
            debug!(namespace = %namespace, reason = check.reason(), "credential functional");
        } else {
            info!(namespace = %namespace, reason = check.reason(), "credential check failed");
        }
        check
    }
}

/// Evaluate probes in order, stopping at the first denial or error
async fn run_probes(reviewer: &dyn AccessReviewer, probes: &[PermissionProbe]) -> CredentialState {
    for probe in probes {
        match reviewer.review(probe).await {
            Ok(true) => continue,
            Ok(false) => return CredentialState::Unauthorized(probe.clone()),
            Err(e) => {
                warn!(probe = %probe, error = %e, "permission check failed");
                return CredentialState::ProbeError {
                    probe: probe.clone(),
                    error: e.to_string(),
                };
            }
        }
    }
    CredentialState::Functional
}
