//! Common types for tether: the status document, merge helpers, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod generations;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the agent runs in when a TetherAgent does not name one
pub const DEFAULT_AGENT_NAMESPACE: &str = "tether-agent";

/// Secret holding the kubeconfig the agent uses to talk to its hub
pub const HUB_KUBECONFIG_SECRET: &str = "hub-kubeconfig-secret";

/// Secret holding the bootstrap kubeconfig used to obtain the hub kubeconfig
pub const BOOTSTRAP_KUBECONFIG_SECRET: &str = "bootstrap-hub-kubeconfig";

/// Secret data key holding a serialized kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Secret data key holding the registered cluster name
pub const CLUSTER_NAME_KEY: &str = "cluster-name";

/// Field manager name used for every write this operator makes
pub const FIELD_MANAGER: &str = "tether-operator";

/// Finalizer that runs cleanup of the static manifests before deletion
pub const CLEANUP_FINALIZER: &str = "tether.dev/cleanup";

/// Annotation carrying the hash of a Deployment's desired spec
pub const SPEC_HASH_ANNOTATION: &str = "tether.dev/spec-hash";
