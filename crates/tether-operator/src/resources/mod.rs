//! Declarative apply of managed resources
//!
//! [`ApplyEngine`] creates, updates or leaves alone each object named by a
//! batch of manifest keys. Every key gets its own [`ApplyOutcome`]; one bad
//! manifest never stops its siblings.

mod engine;
pub mod kinds;
pub mod manifests;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::ApplyEngine;
pub use kinds::{KindRegistry, ManagedKind, ResourceKind};
pub use manifests::{ManifestSource, ManifestTemplates, ManifestValues};

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;

use tether_common::{Error, FIELD_MANAGER};

/// Object store the engine reads and writes through
///
/// `namespace` is `None` for cluster-scoped kinds. `update` must carry the
/// read `resourceVersion` and fail with a conflict when it is stale.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object, `Ok(None)` when it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create an object
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace an existing object
    async fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object; a missing object is reported as a not-found error
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        match self.api(resource, namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        Ok(self
            .api(resource, namespace)
            .create(&Self::post_params(), object)
            .await?)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = object.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .api(resource, namespace)
            .replace(name, &Self::post_params(), object)
            .await?)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

/// Result of applying one manifest key
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Manifest key the object came from
    pub key: String,
    /// Kind of the object (empty if the manifest could not be read)
    pub kind: String,
    /// Name of the object (empty if the manifest could not be read)
    pub name: String,
    /// Whether a create or update was issued
    pub applied: bool,
    /// Why this object could not be applied
    pub error: Option<Error>,
}

impl ApplyOutcome {
    /// Outcome for a manifest that was applied or found up to date
    pub fn success(key: &str, kind: &str, name: &str, applied: bool) -> Self {
        Self {
            key: key.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            applied,
            error: None,
        }
    }

    /// Outcome for a manifest that failed
    pub fn failure(key: &str, kind: &str, name: &str, error: Error) -> Self {
        Self {
            key: key.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            applied: false,
            error: Some(error),
        }
    }

    /// Whether this outcome carries an error
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Join every failed outcome into one message, one line per failure
pub fn aggregate_errors(outcomes: &[ApplyOutcome]) -> Option<String> {
    let lines: Vec<String> = outcomes
        .iter()
        .filter_map(|o| {
            let err = o.error.as_ref()?;
            Some(if o.kind.is_empty() {
                format!("{}: {}", o.key, err)
            } else {
                format!("{} {:?}: {}", o.kind, o.name, err)
            })
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_none_when_everything_applied() {
        let outcomes = vec![
            ApplyOutcome::success("a", "Secret", "n1", true),
            ApplyOutcome::success("b", "Secret", "n2", false),
        ];
        assert!(aggregate_errors(&outcomes).is_none());
    }

    #[test]
    fn aggregate_lists_each_failure_on_its_own_line() {
        let outcomes = vec![
            ApplyOutcome::success("a", "Secret", "n1", true),
            ApplyOutcome::failure("kind1", "Kind1", "n1", Error::unsupported_kind("Kind1")),
            ApplyOutcome::failure("missing", "", "", Error::manifest("missing", "Failed to find file")),
        ];
        let message = aggregate_errors(&outcomes).expect("should aggregate");
        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Kind1 \"n1\""));
        assert!(lines[1].starts_with("missing:"));
    }
}
