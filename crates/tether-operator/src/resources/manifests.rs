//! Desired-state manifests
//!
//! A [`ManifestSource`] turns a lookup key into manifest bytes. Plain closures
//! work as sources in tests; the operator uses [`ManifestTemplates`], which
//! renders YAML templates embedded at compile time with per-agent values.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Node;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use tether_common::crd::NodePlacement;
use tether_common::Error;

/// Key of the AppliedManifestWork CRD template
pub const APPLIED_MANIFEST_WORK_CRD: &str = "crds/appliedmanifestworks.crd.yaml";

/// Key of the ClusterClaim CRD template
pub const CLUSTER_CLAIM_CRD: &str = "crds/clusterclaims.crd.yaml";

/// Key of the registration agent Deployment template
pub const REGISTRATION_DEPLOYMENT: &str = "agent/registration-deployment.yaml";

/// Key of the work agent Deployment template
pub const WORK_DEPLOYMENT: &str = "agent/work-deployment.yaml";

/// Cluster-scoped objects applied for every agent
pub const STATIC_MANIFESTS: &[&str] = &[APPLIED_MANIFEST_WORK_CRD, CLUSTER_CLAIM_CRD];

/// Agent Deployments, applied with node placement and generation tracking
pub const DEPLOYMENT_MANIFESTS: &[&str] = &[REGISTRATION_DEPLOYMENT, WORK_DEPLOYMENT];

const TEMPLATES: &[(&str, &str)] = &[
    (
        APPLIED_MANIFEST_WORK_CRD,
        include_str!("../../templates/crds/appliedmanifestworks.crd.yaml"),
    ),
    (
        CLUSTER_CLAIM_CRD,
        include_str!("../../templates/crds/clusterclaims.crd.yaml"),
    ),
    (
        REGISTRATION_DEPLOYMENT,
        include_str!("../../templates/agent/registration-deployment.yaml"),
    ),
    (
        WORK_DEPLOYMENT,
        include_str!("../../templates/agent/work-deployment.yaml"),
    ),
];

/// Replicas when the cluster has a single control-plane node
pub const SINGLE_REPLICA: i32 = 1;

/// Replicas on a highly available control plane
pub const DEFAULT_REPLICA: i32 = 3;

const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// Resolves a lookup key into desired manifest bytes
pub trait ManifestSource: Send + Sync {
    /// Return the manifest for `key`, or an error if there is none
    fn resolve(&self, key: &str) -> Result<Vec<u8>, Error>;
}

impl<F> ManifestSource for F
where
    F: Fn(&str) -> Result<Vec<u8>, Error> + Send + Sync,
{
    fn resolve(&self, key: &str) -> Result<Vec<u8>, Error> {
        self(key)
    }
}

/// Values substituted into the embedded templates
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ManifestValues {
    /// Name the cluster is registered under (may be empty before registration)
    pub cluster_name: String,
    /// Namespace the agent Deployments run in
    pub agent_namespace: String,
    /// Replica count for agent Deployments
    pub replicas: i32,
    /// Registration agent image
    pub registration_image: String,
    /// Work agent image
    pub work_image: String,
}

/// Embedded templates rendered with one agent's values
pub struct ManifestTemplates {
    env: Environment<'static>,
    values: ManifestValues,
}

impl ManifestTemplates {
    /// Load the embedded templates.
    ///
    /// Fails only if an embedded template does not parse.
    pub fn new(values: ManifestValues) -> Result<Self, Error> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        for (name, source) in TEMPLATES {
            env.add_template(*name, *source)
                .map_err(|e| Error::manifest(*name, e.to_string()))?;
        }
        Ok(Self { env, values })
    }
}

impl ManifestSource for ManifestTemplates {
    fn resolve(&self, key: &str) -> Result<Vec<u8>, Error> {
        let template = self
            .env
            .get_template(key)
            .map_err(|e| Error::manifest(key, e.to_string()))?;
        template
            .render(&self.values)
            .map(String::into_bytes)
            .map_err(|e| Error::manifest(key, e.to_string()))
    }
}

/// Decode manifest bytes (YAML or JSON) into a JSON object
pub fn decode_manifest(key: &str, raw: &[u8]) -> Result<serde_json::Value, Error> {
    let value: serde_json::Value =
        serde_yaml::from_slice(raw).map_err(|e| Error::manifest(key, e.to_string()))?;
    if !value.is_object() {
        return Err(Error::manifest(key, "manifest is not an object"));
    }
    Ok(value)
}

/// Overwrite the pod template's node selector and tolerations
pub fn inject_node_placement(deployment: &mut Deployment, placement: &NodePlacement) {
    let pod_spec = deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default);

    pod_spec.node_selector =
        (!placement.node_selector.is_empty()).then(|| placement.node_selector.clone());
    pod_spec.tolerations =
        (!placement.tolerations.is_empty()).then(|| placement.tolerations.clone());
}

/// Whether a node carries a control-plane role label
pub fn is_control_plane_node(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| CONTROL_PLANE_LABELS.iter().any(|l| labels.contains_key(*l)))
}

/// Agent replica count for a cluster with the given nodes
pub fn replicas_for_nodes(nodes: &[Node]) -> i32 {
    let control_plane = nodes.iter().filter(|n| is_control_plane_node(n)).count();
    if control_plane > 1 {
        DEFAULT_REPLICA
    } else {
        SINGLE_REPLICA
    }
}
