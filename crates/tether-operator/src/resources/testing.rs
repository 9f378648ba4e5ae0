//! In-memory object store for engine tests
//!
//! Behaves like an API server for the parts the engine depends on: it assigns
//! uid, resourceVersion and generation, rejects stale updates with 409 and
//! reports missing objects with 404.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use tether_common::Error;

use super::ResourceStore;

type ObjectKey = (String, String, String);

/// Calls observed by [`MemoryStore`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    calls: Mutex<StoreCalls>,
    version: AtomicU64,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        format!("{}/{}", resource.group, resource.plural),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> StoreCalls {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn object(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&key(resource, namespace, name))
            .cloned()
    }

    /// Overwrite the stored generation, as a rollout by another writer would
    pub fn set_generation(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        generation: i64,
    ) {
        if let Some(obj) = self
            .objects
            .lock()
            .expect("objects lock")
            .get_mut(&key(resource, namespace, name))
        {
            obj.metadata.generation = Some(generation);
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.object(resource, namespace, name))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let k = key(resource, namespace, &name);
        let mut objects = self.objects.lock().expect("objects lock");
        if objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("{name:?} already exists")));
        }

        let mut stored = object.clone();
        stored.metadata.namespace = namespace.map(str::to_string);
        stored.metadata.uid = Some(format!("uid-{}", self.next_version()));
        stored.metadata.resource_version = Some(self.next_version());
        stored.metadata.generation = Some(1);
        objects.insert(k, stored.clone());
        self.calls.lock().expect("calls lock").creates += 1;
        Ok(stored)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = object.metadata.name.clone().unwrap_or_default();
        let mut objects = self.objects.lock().expect("objects lock");
        let Some(current) = objects.get_mut(&key(resource, namespace, &name)) else {
            return Err(api_error(404, "NotFound", format!("{name:?} not found")));
        };
        if object.metadata.resource_version != current.metadata.resource_version {
            return Err(api_error(
                409,
                "Conflict",
                format!("{name:?}: the object has been modified"),
            ));
        }

        let mut stored = object.clone();
        let generation = current.metadata.generation.unwrap_or_default();
        stored.metadata.generation = Some(if stored.data != current.data {
            generation + 1
        } else {
            generation
        });
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(self.next_version());
        *current = stored.clone();
        self.calls.lock().expect("calls lock").updates += 1;
        Ok(stored)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error> {
        self.calls.lock().expect("calls lock").deletes += 1;
        match self
            .objects
            .lock()
            .expect("objects lock")
            .remove(&key(resource, namespace, name))
        {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound", format!("{name:?} not found"))),
        }
    }
}
