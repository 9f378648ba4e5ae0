//! Kubernetes-backed implementations of the probe seams

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use tether_common::kube_utils::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use tether_common::Error;

use super::permissions::PermissionProbe;
use super::probe::{AccessReviewer, HubClientFactory, SecretReader};

/// Sustained access reviews per second for one hub client
const PROBE_QPS: NonZeroU32 = match NonZeroU32::new(2) {
    Some(qps) => qps,
    None => panic!("probe qps must be non-zero"),
};

/// Access reviews a hub client may send back to back
const PROBE_BURST: NonZeroU32 = match NonZeroU32::new(5) {
    Some(burst) => burst,
    None => panic!("probe burst must be non-zero"),
};

/// Rate ceiling for probe clients: 2 per second, bursts of 5
pub fn probe_quota() -> Quota {
    Quota::per_second(PROBE_QPS).allow_burst(PROBE_BURST)
}

/// Reads secrets through the local cluster client
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    /// Create a reader wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds hub clients from credential kubeconfigs
#[derive(Default)]
pub struct KubeHubClientFactory;

#[async_trait]
impl HubClientFactory for KubeHubClientFactory {
    async fn connect(&self, kubeconfig: Kubeconfig) -> Result<Arc<dyn AccessReviewer>, Error> {
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let client = Client::try_from(config)
            .map_err(|e| Error::config(format!("failed to create client: {}", e)))?;
        Ok(Arc::new(SsarReviewer::new(client)))
    }
}

/// Answers probes with SelfSubjectAccessReviews, throttled per client
pub struct SsarReviewer {
    client: Client,
    limiter: DefaultDirectRateLimiter,
}

impl SsarReviewer {
    /// Reviewer over `client` with the probe rate ceiling
    pub fn new(client: Client) -> Self {
        Self {
            client,
            limiter: RateLimiter::direct(probe_quota()),
        }
    }
}

#[async_trait]
impl AccessReviewer for SsarReviewer {
    async fn review(&self, probe: &PermissionProbe) -> Result<bool, Error> {
        self.limiter.until_ready().await;

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), &access_review(probe))
            .await?;
        let allowed = created.status.is_some_and(|s| s.allowed);
        trace!(probe = %probe, allowed, "access review");
        Ok(allowed)
    }
}

fn access_review(probe: &PermissionProbe) -> SelfSubjectAccessReview {
    let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                group: Some(probe.group.clone()),
                resource: Some(probe.resource.clone()),
                subresource: opt(&probe.subresource),
                namespace: opt(&probe.namespace),
                name: opt(&probe.name),
                verb: Some(probe.verb.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}
