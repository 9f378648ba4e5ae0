//! Permission sets each hub credential must grant

use std::fmt;

const CLUSTER_GROUP: &str = "cluster.open-cluster-management.io";
const CERTIFICATES_GROUP: &str = "certificates.k8s.io";
const REGISTER_GROUP: &str = "register.open-cluster-management.io";
const COORDINATION_GROUP: &str = "coordination.k8s.io";
const EVENTS_GROUP: &str = "events.k8s.io";
const WORK_GROUP: &str = "work.open-cluster-management.io";

/// A single "can I do this" check against the hub
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionProbe {
    /// API group ("" for core)
    pub group: String,
    /// Plural resource name
    pub resource: String,
    /// Subresource, e.g. `status`
    pub subresource: String,
    /// Namespace, empty for cluster scope
    pub namespace: String,
    /// Object name, empty for any
    pub name: String,
    /// Verb to check
    pub verb: String,
}

impl PermissionProbe {
    fn new(group: &str, resource: &str, verb: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            verb: verb.to_string(),
            ..Default::default()
        }
    }

    fn subresource(mut self, subresource: &str) -> Self {
        self.subresource = subresource.to_string();
        self
    }

    fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

impl fmt::Display for PermissionProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{group: {:?}, resource: {:?}, subresource: {:?}, namespace: {:?}, name: {:?}, verb: {:?}}}",
            self.group, self.resource, self.subresource, self.namespace, self.name, self.verb
        )
    }
}

fn each_verb(verbs: &[&str], build: impl Fn(&str) -> PermissionProbe) -> Vec<PermissionProbe> {
    verbs.iter().map(|verb| build(verb)).collect()
}

/// Checks for the bootstrap credential, in evaluation order
pub fn bootstrap_probes() -> Vec<PermissionProbe> {
    let mut probes = each_verb(&["create", "get"], |v| {
        PermissionProbe::new(CLUSTER_GROUP, "managedclusters", v)
    });
    probes.extend(each_verb(&["create", "get", "list", "watch"], |v| {
        PermissionProbe::new(CERTIFICATES_GROUP, "certificatesigningrequests", v)
    }));
    probes
}

/// Checks for the hub-config credential of `cluster`, in evaluation order
pub fn hub_config_probes(cluster: &str) -> Vec<PermissionProbe> {
    let lease = format!("cluster-lease-{cluster}");

    let mut probes = each_verb(&["get", "list", "watch"], |v| {
        PermissionProbe::new(CERTIFICATES_GROUP, "certificatesigningrequests", v)
    });
    probes.extend(each_verb(&["get", "list", "update", "watch"], |v| {
        PermissionProbe::new(CLUSTER_GROUP, "managedclusters", v).name(cluster)
    }));
    probes.extend(each_verb(&["patch", "update"], |v| {
        PermissionProbe::new(CLUSTER_GROUP, "managedclusters", v)
            .subresource("status")
            .name(cluster)
    }));
    probes.push(
        PermissionProbe::new(REGISTER_GROUP, "managedclusters", "renew")
            .subresource("clientcertificates"),
    );
    probes.extend(each_verb(&["get", "update"], |v| {
        PermissionProbe::new(COORDINATION_GROUP, "leases", v)
            .namespace(cluster)
            .name(&lease)
    }));
    for group in ["", EVENTS_GROUP] {
        probes.extend(each_verb(&["create", "patch", "update"], |v| {
            PermissionProbe::new(group, "events", v).namespace(cluster)
        }));
    }
    probes.extend(each_verb(&["get", "list", "watch", "update"], |v| {
        PermissionProbe::new(WORK_GROUP, "manifestworks", v).namespace(cluster)
    }));
    probes.extend(each_verb(&["patch", "update"], |v| {
        PermissionProbe::new(WORK_GROUP, "manifestworks", v)
            .subresource("status")
            .namespace(cluster)
    }));
    probes
}
