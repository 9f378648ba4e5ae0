//! Create/update/no-op decisions for managed resources

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::DynamicObject;
use kube::Resource;
use tracing::{debug, info, warn};

use tether_common::crd::NodePlacement;
use tether_common::generations::{find_generation, GenerationRecord};
use tether_common::kube_utils::deterministic_hash;
use tether_common::{Error, SPEC_HASH_ANNOTATION};

use super::kinds::{from_dynamic, merge_metadata, to_dynamic, KindRegistry, ResourceKind};
use super::manifests::{decode_manifest, inject_node_placement, ManifestSource};
use super::{ApplyOutcome, ResourceStore};

/// A decoded manifest with the fields needed to address it
struct Desired {
    kind: String,
    name: String,
    namespace: Option<String>,
    manifest: serde_json::Value,
}

impl Desired {
    fn load(source: &dyn ManifestSource, key: &str) -> Result<Self, Error> {
        let raw = source.resolve(key)?;
        let manifest = decode_manifest(key, &raw)?;
        let field = |path: &[&str]| {
            path.iter()
                .try_fold(&manifest, |v, p| v.get(p))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Ok(Self {
            kind: field(&["kind"]).unwrap_or_default(),
            name: field(&["metadata", "name"]).unwrap_or_default(),
            namespace: field(&["metadata", "namespace"]),
            manifest,
        })
    }
}

/// Applies desired manifests against a [`ResourceStore`]
pub struct ApplyEngine {
    store: Arc<dyn ResourceStore>,
    registry: Arc<KindRegistry>,
}

impl ApplyEngine {
    /// Create an engine over the given store and kind registry
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<KindRegistry>) -> Self {
        Self { store, registry }
    }

    /// Apply every key in order, one outcome per key.
    ///
    /// Failures are recorded on their outcome and never stop the batch.
    /// Deployments are refused here; they go through [`Self::apply_deployment`].
    pub async fn apply(&self, source: &dyn ManifestSource, keys: &[&str]) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let outcome = match Desired::load(source, key) {
                Ok(desired) => match self.apply_desired(key, &desired).await {
                    Ok(applied) => {
                        ApplyOutcome::success(key, &desired.kind, &desired.name, applied)
                    }
                    Err(e) => ApplyOutcome::failure(key, &desired.kind, &desired.name, e),
                },
                Err(e) => ApplyOutcome::failure(key, "", "", e),
            };
            if let Some(err) = &outcome.error {
                warn!(key = %key, kind = %outcome.kind, name = %outcome.name, error = %err, "apply failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn apply_desired(&self, key: &str, desired: &Desired) -> Result<bool, Error> {
        let strategy = self.registry.lookup(&desired.kind)?;
        if !strategy.batch_apply() {
            return Err(Error::manifest(
                key,
                format!("{} manifests are applied with apply_deployment", desired.kind),
            ));
        }
        let object = strategy.decode(desired.manifest.clone())?;
        let namespace = strategy
            .namespaced()
            .then_some(desired.namespace.as_deref())
            .flatten();
        let resource = strategy.api_resource();

        let Some(existing) = self.store.get(resource, namespace, &desired.name).await? else {
            self.store.create(resource, namespace, &object).await?;
            info!(kind = %desired.kind, name = %desired.name, "created");
            return Ok(true);
        };

        match strategy.diff(&existing, &object)? {
            Some(update) => {
                self.store.update(resource, namespace, &update).await?;
                info!(kind = %desired.kind, name = %desired.name, "updated");
                Ok(true)
            }
            None => {
                debug!(kind = %desired.kind, name = %desired.name, "up to date");
                Ok(false)
            }
        }
    }

    /// Apply one agent Deployment.
    ///
    /// The node placement overrides the template's selector and tolerations,
    /// and a hash of the resulting spec is stamped on the metadata. The update
    /// is skipped when the metadata already matches and the live generation is
    /// the one last recorded in `generations`. On success the returned record
    /// holds the generation to store.
    pub async fn apply_deployment(
        &self,
        source: &dyn ManifestSource,
        key: &str,
        placement: &NodePlacement,
        generations: &[GenerationRecord],
    ) -> (ApplyOutcome, Option<GenerationRecord>) {
        let desired = match Desired::load(source, key) {
            Ok(desired) => desired,
            Err(e) => return (ApplyOutcome::failure(key, "", "", e), None),
        };

        match self.apply_deployment_desired(&desired, placement, generations).await {
            Ok((applied, record)) => (
                ApplyOutcome::success(key, &desired.kind, &desired.name, applied),
                Some(record),
            ),
            Err(e) => {
                warn!(key = %key, name = %desired.name, error = %e, "deployment apply failed");
                (
                    ApplyOutcome::failure(key, &desired.kind, &desired.name, e),
                    None,
                )
            }
        }
    }

    async fn apply_deployment_desired(
        &self,
        desired: &Desired,
        placement: &NodePlacement,
        generations: &[GenerationRecord],
    ) -> Result<(bool, GenerationRecord), Error> {
        let kind = ResourceKind::Deployment;
        if desired.kind != kind.as_str() {
            return Err(Error::unsupported_kind(desired.kind.clone()));
        }
        let strategy = self.registry.lookup(kind.as_str())?;
        let resource = strategy.api_resource();

        let mut deployment: Deployment = serde_json::from_value(desired.manifest.clone())
            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;
        inject_node_placement(&mut deployment, placement);
        stamp_spec_hash(&mut deployment)?;

        let namespace = desired.namespace.as_deref();
        let record = |obj: &DynamicObject| {
            GenerationRecord::for_object(&resource.group, &resource.plural, &obj.metadata)
        };

        let Some(existing) = self.store.get(resource, namespace, &desired.name).await? else {
            let created = self
                .store
                .create(resource, namespace, &to_dynamic(&deployment, kind)?)
                .await?;
            info!(name = %desired.name, "created deployment");
            return Ok((true, record(&created)));
        };

        let mut merged: Deployment = from_dynamic(&existing, kind)?;
        let meta_changed = merge_metadata(merged.meta_mut(), &deployment.metadata);
        let expected = find_generation(
            generations,
            &resource.group,
            &resource.plural,
            namespace.unwrap_or_default(),
            &desired.name,
        )
        .map(|r| r.last_generation);

        if !meta_changed && expected == Some(existing.metadata.generation.unwrap_or_default()) {
            debug!(name = %desired.name, "deployment up to date");
            return Ok((false, record(&existing)));
        }

        merged.spec = deployment.spec;
        let updated = self
            .store
            .update(resource, namespace, &to_dynamic(&merged, kind)?)
            .await?;
        info!(name = %desired.name, "updated deployment");
        Ok((true, record(&updated)))
    }

    /// Delete every key in order, stopping at the first error.
    ///
    /// Objects that are already gone count as deleted.
    pub async fn cleanup(&self, source: &dyn ManifestSource, keys: &[&str]) -> Result<(), Error> {
        for key in keys {
            let desired = Desired::load(source, key)?;
            let strategy = self.registry.lookup(&desired.kind)?;
            let namespace = strategy
                .namespaced()
                .then_some(desired.namespace.as_deref())
                .flatten();

            match self
                .store
                .delete(strategy.api_resource(), namespace, &desired.name)
                .await
            {
                Ok(()) => info!(kind = %desired.kind, name = %desired.name, "deleted"),
                Err(e) if e.is_not_found() => {
                    debug!(kind = %desired.kind, name = %desired.name, "already deleted")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn stamp_spec_hash(deployment: &mut Deployment) -> Result<(), Error> {
    let spec = serde_json::to_string(&deployment.spec)
        .map_err(|e| Error::serialization_for_kind("Deployment", e.to_string()))?;
    deployment
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SPEC_HASH_ANNOTATION.to_string(), deterministic_hash(&spec));
    Ok(())
}
