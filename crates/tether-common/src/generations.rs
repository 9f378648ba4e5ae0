//! Last-observed generation records for applied resources
//!
//! Records are keyed by (group, resource, namespace, name). The list keeps
//! insertion order; an existing record is updated in place.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Generation last observed on an object this operator applied
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    /// API group of the resource ("" for core, "apps" for Deployments)
    #[serde(default)]
    pub group: String,

    /// Plural resource name (e.g., "deployments")
    pub resource: String,

    /// Namespace of the object ("" for cluster-scoped objects)
    #[serde(default)]
    pub namespace: String,

    /// Name of the object
    pub name: String,

    /// `metadata.generation` observed after the last write
    pub last_generation: i64,
}

impl GenerationRecord {
    /// Build a record for an object as returned by the API server.
    pub fn for_object(group: &str, resource: &str, meta: &ObjectMeta) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            last_generation: meta.generation.unwrap_or_default(),
        }
    }

    /// Whether this record names the same object as `other`
    pub fn same_object(&self, other: &GenerationRecord) -> bool {
        self.matches(&other.group, &other.resource, &other.namespace, &other.name)
    }

    fn matches(&self, group: &str, resource: &str, namespace: &str, name: &str) -> bool {
        self.group == group
            && self.resource == resource
            && self.namespace == namespace
            && self.name == name
    }
}

/// Merge `record` into `records`, returning whether the list changed.
pub fn record_generation(records: &mut Vec<GenerationRecord>, record: GenerationRecord) -> bool {
    match records.iter_mut().find(|r| r.same_object(&record)) {
        Some(existing) if existing.last_generation == record.last_generation => false,
        Some(existing) => {
            existing.last_generation = record.last_generation;
            true
        }
        None => {
            records.push(record);
            true
        }
    }
}

/// Find the record for the given object identity
pub fn find_generation<'a>(
    records: &'a [GenerationRecord],
    group: &str,
    resource: &str,
    namespace: &str,
    name: &str,
) -> Option<&'a GenerationRecord> {
    records
        .iter()
        .find(|r| r.matches(group, resource, namespace, name))
}
