//! Per-kind apply strategies
//!
//! Each managed kind knows how to decode a desired manifest into its typed
//! shape and how to fold a desired object into the live one. The engine only
//! talks to the [`ManagedKind`] trait, so adding a kind means registering one
//! more strategy in [`KindRegistry::default`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use tether_common::Error;

/// Kinds this operator knows how to apply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// admissionregistration.k8s.io/v1 ValidatingWebhookConfiguration
    ValidatingWebhookConfiguration,
    /// admissionregistration.k8s.io/v1 MutatingWebhookConfiguration
    MutatingWebhookConfiguration,
    /// apiregistration.k8s.io/v1 APIService
    ApiService,
    /// v1 Secret
    Secret,
    /// apiextensions.k8s.io/v1 CustomResourceDefinition
    CustomResourceDefinition,
    /// apps/v1 Deployment
    Deployment,
}

impl ResourceKind {
    /// The `kind` field value for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
            Self::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
            Self::ApiService => "APIService",
            Self::Secret => "Secret",
            Self::CustomResourceDefinition => "CustomResourceDefinition",
            Self::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind {
            "ValidatingWebhookConfiguration" => Ok(Self::ValidatingWebhookConfiguration),
            "MutatingWebhookConfiguration" => Ok(Self::MutatingWebhookConfiguration),
            "APIService" => Ok(Self::ApiService),
            "Secret" => Ok(Self::Secret),
            "CustomResourceDefinition" => Ok(Self::CustomResourceDefinition),
            "Deployment" => Ok(Self::Deployment),
            other => Err(Error::unsupported_kind(other)),
        }
    }
}

/// Apply strategy for one managed kind
pub trait ManagedKind: Send + Sync {
    /// Which kind this strategy handles
    fn kind(&self) -> ResourceKind;

    /// API coordinates used to reach the object store
    fn api_resource(&self) -> &ApiResource;

    /// Whether objects of this kind live in a namespace
    fn namespaced(&self) -> bool;

    /// Whether the generic batch apply may write this kind.
    ///
    /// Kinds that need extra handling, like Deployment placement and
    /// generation tracking, return false and have their own apply path.
    fn batch_apply(&self) -> bool;

    /// Decode a desired manifest, rejecting payloads that do not fit the kind
    fn decode(&self, manifest: serde_json::Value) -> Result<DynamicObject, Error>;

    /// Fold `desired` into `existing`.
    ///
    /// Returns the object to write back, or `None` when the live object
    /// already matches. Server-managed metadata of `existing` is preserved.
    fn diff(
        &self,
        existing: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error>;
}

/// Merge function for the kind-specific body of an object
pub type MergeFn<K> = fn(&mut K, &K) -> bool;

/// [`ManagedKind`] backed by a typed k8s-openapi resource
pub struct TypedKind<K> {
    kind: ResourceKind,
    api_resource: ApiResource,
    namespaced: bool,
    batch_apply: bool,
    merge: MergeFn<K>,
    _marker: PhantomData<fn() -> K>,
}

impl<K> TypedKind<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Build a strategy whose body is folded in with `merge`
    pub fn new(kind: ResourceKind, namespaced: bool, merge: MergeFn<K>) -> Self {
        Self {
            kind,
            api_resource: ApiResource::erase::<K>(&()),
            namespaced,
            batch_apply: true,
            merge,
            _marker: PhantomData,
        }
    }

    /// Keep this kind out of the generic batch apply
    pub fn apply_separately(mut self) -> Self {
        self.batch_apply = false;
        self
    }
}

impl<K> ManagedKind for TypedKind<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn api_resource(&self) -> &ApiResource {
        &self.api_resource
    }

    fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn batch_apply(&self) -> bool {
        self.batch_apply
    }

    fn decode(&self, manifest: serde_json::Value) -> Result<DynamicObject, Error> {
        let typed: K = serde_json::from_value(manifest)
            .map_err(|e| Error::serialization_for_kind(self.kind.as_str(), e.to_string()))?;
        to_dynamic(&typed, self.kind)
    }

    fn diff(
        &self,
        existing: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error> {
        let mut merged: K = from_dynamic(existing, self.kind)?;
        let desired: K = from_dynamic(desired, self.kind)?;

        let meta_changed = merge_metadata(merged.meta_mut(), desired.meta());
        let body_changed = (self.merge)(&mut merged, &desired);

        if meta_changed || body_changed {
            Ok(Some(to_dynamic(&merged, self.kind)?))
        } else {
            Ok(None)
        }
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: Serialize>(typed: &K, kind: ResourceKind) -> Result<DynamicObject, Error> {
    serde_json::to_value(typed)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
}

/// Convert a dynamic object into its typed form
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject, kind: ResourceKind) -> Result<K, Error> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
}

/// Merge desired labels and annotations into live metadata.
///
/// Keys the desired object does not mention are left alone.
pub fn merge_metadata(existing: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let labels = merge_string_map(&mut existing.labels, desired.labels.as_ref());
    let annotations = merge_string_map(&mut existing.annotations, desired.annotations.as_ref());
    labels || annotations
}

fn merge_string_map(
    existing: &mut Option<BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired.filter(|d| !d.is_empty()) else {
        return false;
    };
    let target = existing.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (key, value) in desired {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Replace `slot` with `desired` when they differ
pub fn replace_field<T: PartialEq + Clone>(slot: &mut T, desired: &T) -> bool {
    if slot == desired {
        return false;
    }
    *slot = desired.clone();
    true
}

/// Replace `slot` with `desired` unless the live value already covers it.
///
/// The API server fills in defaults the desired manifest never mentions
/// (webhook `timeoutSeconds`, CRD `conversion`), so the live value only has to
/// agree on every field the desired value sets. Lists must match element by
/// element; when anything differs the desired value replaces the live one whole.
pub fn replace_unless_covered<T: Serialize + Clone>(slot: &mut T, desired: &T) -> bool {
    let covered = match (serde_json::to_value(&*slot), serde_json::to_value(desired)) {
        (Ok(live), Ok(wanted)) => covers(&live, &wanted),
        _ => false,
    };
    if covered {
        return false;
    }
    *slot = desired.clone();
    true
}

fn covers(live: &serde_json::Value, desired: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (live, desired) {
        (_, Value::Null) => true,
        (Value::Object(live), Value::Object(desired)) => desired
            .iter()
            .all(|(key, want)| live.get(key).map_or(want.is_null(), |have| covers(have, want))),
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len() && live.iter().zip(desired).all(|(l, d)| covers(l, d))
        }
        (live, desired) => live == desired,
    }
}

fn merge_validating_webhooks(
    existing: &mut ValidatingWebhookConfiguration,
    desired: &ValidatingWebhookConfiguration,
) -> bool {
    replace_unless_covered(&mut existing.webhooks, &desired.webhooks)
}

fn merge_mutating_webhooks(
    existing: &mut MutatingWebhookConfiguration,
    desired: &MutatingWebhookConfiguration,
) -> bool {
    replace_unless_covered(&mut existing.webhooks, &desired.webhooks)
}

fn merge_api_service(existing: &mut APIService, desired: &APIService) -> bool {
    replace_unless_covered(&mut existing.spec, &desired.spec)
}

fn merge_crd(existing: &mut CustomResourceDefinition, desired: &CustomResourceDefinition) -> bool {
    replace_unless_covered(&mut existing.spec, &desired.spec)
}

fn merge_deployment(existing: &mut Deployment, desired: &Deployment) -> bool {
    replace_field(&mut existing.spec, &desired.spec)
}

fn merge_secret(existing: &mut Secret, desired: &Secret) -> bool {
    let mut data = desired.data.clone().unwrap_or_default();
    if let Some(string_data) = &desired.string_data {
        for (key, value) in string_data {
            data.insert(key.clone(), ByteString(value.clone().into_bytes()));
        }
    }
    let data = (!data.is_empty()).then_some(data);

    let mut changed = replace_field(&mut existing.data, &data);
    if desired.type_.is_some() {
        changed |= replace_field(&mut existing.type_, &desired.type_);
    }
    existing.string_data = None;
    changed
}

/// Maps kind tags to their apply strategies
pub struct KindRegistry {
    strategies: HashMap<ResourceKind, Arc<dyn ManagedKind>>,
}

impl KindRegistry {
    /// A registry with no strategies
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register a strategy, replacing any previous one for the same kind
    pub fn register(&mut self, strategy: Arc<dyn ManagedKind>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    /// Look up the strategy for a manifest's `kind` field
    pub fn lookup(&self, kind: &str) -> Result<Arc<dyn ManagedKind>, Error> {
        let parsed: ResourceKind = kind.parse()?;
        self.strategies
            .get(&parsed)
            .cloned()
            .ok_or_else(|| Error::unsupported_kind(kind))
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TypedKind::new(
            ResourceKind::ValidatingWebhookConfiguration,
            false,
            merge_validating_webhooks,
        )));
        registry.register(Arc::new(TypedKind::new(
            ResourceKind::MutatingWebhookConfiguration,
            false,
            merge_mutating_webhooks,
        )));
        registry.register(Arc::new(TypedKind::new(
            ResourceKind::ApiService,
            false,
            merge_api_service,
        )));
        registry.register(Arc::new(TypedKind::new(
            ResourceKind::Secret,
            true,
            merge_secret,
        )));
        registry.register(Arc::new(TypedKind::new(
            ResourceKind::CustomResourceDefinition,
            false,
            merge_crd,
        )));
        registry.register(Arc::new(TypedKind::new(
            ResourceKind::Deployment,
            true,
            merge_deployment,
        )
        .apply_separately()));
        registry
    }
}
