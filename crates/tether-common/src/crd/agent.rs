//! TetherAgent CRD
//!
//! A TetherAgent represents the agent side of a managed cluster's connection
//! to its hub: where the agent runs, how its Deployments are placed, and the
//! health of the credentials it uses to reach the hub.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{set_condition, Condition};
use crate::generations::{record_generation, GenerationRecord};
use crate::DEFAULT_AGENT_NAMESPACE;

/// TetherAgent defines an agent installation on a managed cluster.
///
/// Example:
/// ```yaml
/// apiVersion: tether.dev/v1alpha1
/// kind: TetherAgent
/// metadata:
///   name: agent
/// spec:
///   clusterName: edge-01
///   namespace: tether-agent
///   nodePlacement:
///     nodeSelector:
///       node-role.kubernetes.io/infra: ""
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tether.dev",
    version = "v1alpha1",
    kind = "TetherAgent",
    status = "TetherAgentStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.namespace"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TetherAgentSpec {
    /// Name this cluster is registered under on the hub.
    /// When empty, the hub-config secret's `cluster-name` key is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Namespace the agent Deployments and credential secrets live in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Registration agent image (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_image: Option<String>,

    /// Work agent image (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_image: Option<String>,

    /// Node placement applied to every agent Deployment
    #[serde(default)]
    pub node_placement: NodePlacement,
}

/// Node selector and tolerations injected into agent pod templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    /// Node labels the agent pods must be scheduled onto
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Taints the agent pods tolerate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

/// TetherAgent status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TetherAgentStatus {
    /// Spec generation the status was last computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Named conditions (HubConnectionDegraded, ManifestsApplied, ...)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generations of the Deployments this operator applied
    #[serde(default)]
    pub generations: Vec<GenerationRecord>,
}

impl TetherAgentStatus {
    /// Merge a condition, returning whether the status changed
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        set_condition(&mut self.conditions, condition)
    }

    /// Merge a generation record, returning whether the status changed
    pub fn record_generation(&mut self, record: GenerationRecord) -> bool {
        record_generation(&mut self.generations, record)
    }

    /// Set the observed generation, returning whether it changed
    pub fn observe_generation(&mut self, generation: Option<i64>) -> bool {
        if generation.is_none() || self.observed_generation == generation {
            return false;
        }
        self.observed_generation = generation;
        true
    }
}

impl TetherAgent {
    /// Namespace the agent runs in, falling back to the default
    pub fn agent_namespace(&self) -> &str {
        self.spec
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_AGENT_NAMESPACE)
    }

    /// Cluster name from the spec, if set and non-empty
    pub fn cluster_name(&self) -> Option<&str> {
        self.spec.cluster_name.as_deref().filter(|n| !n.is_empty())
    }
}
