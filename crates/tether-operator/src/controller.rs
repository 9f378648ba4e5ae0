//! TetherAgent reconciliation
//!
//! Each reconcile applies the agent's managed resources, records what was
//! applied in the agent status, then hands the agent to [`sync`], which runs
//! the hub credential probe in the background at most once per agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use tether_common::conditions::{Condition, ConditionStatus};
use tether_common::crd::{TetherAgent, TetherAgentStatus};
use tether_common::generations::GenerationRecord;
use tether_common::retry::{retry_on_conflict, RetryConfig};
use tether_common::{Error, CLEANUP_FINALIZER, FIELD_MANAGER};

use crate::config::OperatorConfig;
use crate::guard::{ProbeGuard, ProbeLease};
use crate::health::{HealthProbe, KubeHubClientFactory, KubeSecretReader};
use crate::resources::manifests::{
    replicas_for_nodes, DEPLOYMENT_MANIFESTS, SINGLE_REPLICA, STATIC_MANIFESTS,
};
use crate::resources::{
    aggregate_errors, ApplyEngine, ApplyOutcome, KindRegistry, KubeResourceStore,
    ManifestTemplates, ManifestValues,
};
#[cfg(test)]
use crate::{
    health::{HubClientFactory, SecretReader},
    resources::ResourceStore,
};

/// Condition type reporting whether every managed resource was applied
pub const MANIFESTS_APPLIED: &str = "ManifestsApplied";

/// Requeue delay after adding the cleanup finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Kubernetes operations on TetherAgents and the cluster they run on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Get a TetherAgent by name
    async fn get_agent(&self, name: &str) -> Result<Option<TetherAgent>, Error>;

    /// Write an agent's status.
    ///
    /// A non-empty `resource_version` must still be current or the write
    /// fails with a conflict.
    async fn patch_agent_status(
        &self,
        name: &str,
        resource_version: &str,
        status: &TetherAgentStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a TetherAgent
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a TetherAgent
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// List the cluster's nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// [`AgentClient`] backed by the Kubernetes API
pub struct AgentClientImpl {
    client: Client,
}

impl AgentClientImpl {
    /// Create a new AgentClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn agents(&self) -> Api<TetherAgent> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl AgentClient for AgentClientImpl {
    async fn get_agent(&self, name: &str) -> Result<Option<TetherAgent>, Error> {
        match self.agents().get(name).await {
            Ok(agent) => Ok(Some(agent)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_agent_status(
        &self,
        name: &str,
        resource_version: &str,
        status: &TetherAgentStatus,
    ) -> Result<(), Error> {
        let mut patch = serde_json::json!({ "status": status });
        if !resource_version.is_empty() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
        }

        self.agents()
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api = self.agents();
        let agent = api.get(name).await?;
        let mut finalizers = agent.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api = self.agents();
        let agent = api.get(name).await?;
        let finalizers: Vec<String> = agent
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// A single change to an agent's status
#[derive(Clone, Debug, PartialEq)]
pub enum StatusUpdate {
    /// Merge a condition by type
    Condition(Condition),
    /// Merge a generation record by object identity
    Generation(GenerationRecord),
    /// Record the spec generation the status reflects
    ObservedGeneration(Option<i64>),
}

impl StatusUpdate {
    fn apply(&self, status: &mut TetherAgentStatus) -> bool {
        match self {
            Self::Condition(c) => status.set_condition(c.clone()),
            Self::Generation(g) => status.record_generation(g.clone()),
            Self::ObservedGeneration(g) => status.observe_generation(*g),
        }
    }
}

/// Apply `updates` to the current status of agent `name`.
///
/// Reads the agent, merges the updates into a copy of its status and writes
/// it back against the read resourceVersion, starting over on a conflict.
/// Returns whether anything was written; a deleted agent or an unchanged
/// status writes nothing.
pub async fn update_agent_status(
    kube: &dyn AgentClient,
    name: &str,
    updates: &[StatusUpdate],
) -> Result<bool, Error> {
    retry_on_conflict(&RetryConfig::for_conflicts(), "update_agent_status", move || async move {
        let Some(agent) = kube.get_agent(name).await? else {
            debug!(agent = %name, "agent gone, skipping status update");
            return Ok(false);
        };

        let mut status = agent.status.clone().unwrap_or_default();
        let mut changed = false;
        for update in updates {
            changed |= update.apply(&mut status);
        }
        if !changed {
            return Ok(false);
        }

        let resource_version = agent.metadata.resource_version.as_deref().unwrap_or_default();
        kube.patch_agent_status(name, resource_version, &status)
            .await?;
        Ok(true)
    })
    .await
}

/// Controller context shared by every reconcile
pub struct Context {
    /// Kubernetes client for agent operations (trait object for testability)
    pub kube: Arc<dyn AgentClient>,
    /// Applies managed resources
    pub engine: ApplyEngine,
    /// Checks hub credentials
    pub probe: HealthProbe,
    /// Keys with a probe in flight
    pub guard: ProbeGuard,
    /// Operator settings
    pub config: OperatorConfig,
    /// Cancelled at shutdown; in-flight probes stop without writing
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a context backed by the given kube Client
    pub fn new(client: Client, config: OperatorConfig, cancel: CancellationToken) -> Self {
        Self {
            kube: Arc::new(AgentClientImpl::new(client.clone())),
            engine: ApplyEngine::new(
                Arc::new(KubeResourceStore::new(client.clone())),
                Arc::new(KindRegistry::default()),
            ),
            probe: HealthProbe::new(
                Arc::new(KubeSecretReader::new(client)),
                Arc::new(KubeHubClientFactory),
            ),
            guard: ProbeGuard::new(),
            config,
            cancel,
        }
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn AgentClient>,
        store: Arc<dyn ResourceStore>,
        secrets: Arc<dyn SecretReader>,
        clients: Arc<dyn HubClientFactory>,
    ) -> Self {
        Self {
            kube,
            engine: ApplyEngine::new(store, Arc::new(KindRegistry::default())),
            probe: HealthProbe::new(secrets, clients),
            guard: ProbeGuard::new(),
            config: OperatorConfig::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of handing a key to [`sync`]
#[derive(Debug)]
pub enum SyncOutcome {
    /// A probe was started; the handle resolves once it finished
    Started(JoinHandle<()>),
    /// A probe for this key is still running
    Busy,
}

/// Start a health probe for agent `key` unless one is already running.
///
/// Never blocks. The probe reads the agent, evaluates its hub connection and
/// writes the `HubConnectionDegraded` condition. A probe that hits the
/// configured deadline or the shutdown signal writes nothing. The key is
/// released when the probe task ends, however it ends.
pub fn sync(ctx: &Arc<Context>, key: &str) -> SyncOutcome {
    let Some(lease) = ctx.guard.try_lock(key) else {
        debug!(agent = %key, "probe already in flight");
        return SyncOutcome::Busy;
    };
    SyncOutcome::Started(tokio::spawn(run_probe(ctx.clone(), lease)))
}

async fn run_probe(ctx: Arc<Context>, lease: ProbeLease) {
    let key = lease.key();
    let deadline = ctx.config.probe_timeout();

    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            debug!(agent = %key, "probe cancelled");
            return;
        }
        result = tokio::time::timeout(deadline, probe_and_record(&ctx, key)) => result,
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(agent = %key, error = %e, "hub connection check failed"),
        Err(_) => warn!(agent = %key, timeout = ?deadline, "hub connection check timed out"),
    }
}

/// Probe the agent's hub credentials and write the resulting condition.
///
/// The status write shares the caller's deadline, so a write that keeps
/// conflicting cannot hold the agent's lease past it.
async fn probe_and_record(ctx: &Context, key: &str) -> Result<(), Error> {
    let Some(agent) = ctx.kube.get_agent(key).await? else {
        return Ok(());
    };
    if agent.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let condition = ctx
        .probe
        .composite(agent.agent_namespace(), agent.cluster_name())
        .await;
    let degraded = condition.status == ConditionStatus::True;

    if update_agent_status(ctx.kube.as_ref(), key, &[StatusUpdate::Condition(condition)]).await? {
        info!(agent = %key, degraded, "hub connection condition updated");
    } else {
        debug!(agent = %key, "hub connection condition unchanged");
    }
    Ok(())
}

fn has_finalizer(agent: &TetherAgent) -> bool {
    agent.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

fn manifest_values(agent: &TetherAgent, config: &OperatorConfig, replicas: i32) -> ManifestValues {
    ManifestValues {
        cluster_name: agent.cluster_name().unwrap_or_default().to_string(),
        agent_namespace: agent.agent_namespace().to_string(),
        replicas,
        registration_image: agent
            .spec
            .registration_image
            .clone()
            .unwrap_or_else(|| config.registration_image.clone()),
        work_image: agent
            .spec
            .work_image
            .clone()
            .unwrap_or_else(|| config.work_image.clone()),
    }
}

/// Condition summarizing one apply batch
pub fn manifests_condition(outcomes: &[ApplyOutcome]) -> Condition {
    match aggregate_errors(outcomes) {
        None => Condition::new(
            MANIFESTS_APPLIED,
            ConditionStatus::True,
            "ManifestsApplied",
            "All managed resources are applied",
        ),
        Some(message) => Condition::new(
            MANIFESTS_APPLIED,
            ConditionStatus::False,
            "ManifestApplyFailed",
            message,
        ),
    }
}

/// Reconcile a TetherAgent
#[instrument(skip(agent, ctx), fields(agent = %agent.name_any()))]
pub async fn reconcile(agent: Arc<TetherAgent>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = agent.name_any();
    debug!("reconciling agent");

    if agent.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&agent, &ctx).await;
    }

    if !has_finalizer(&agent) {
        info!("adding cleanup finalizer");
        ctx.kube.add_finalizer(&name, CLEANUP_FINALIZER).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let nodes = ctx.kube.list_nodes().await?;
    let templates = ManifestTemplates::new(manifest_values(
        &agent,
        &ctx.config,
        replicas_for_nodes(&nodes),
    ))?;

    let mut outcomes = ctx.engine.apply(&templates, STATIC_MANIFESTS).await;

    let recorded = agent
        .status
        .as_ref()
        .map(|s| s.generations.as_slice())
        .unwrap_or_default();
    let mut updates = Vec::new();
    for key in DEPLOYMENT_MANIFESTS {
        let (outcome, record) = ctx
            .engine
            .apply_deployment(&templates, key, &agent.spec.node_placement, recorded)
            .await;
        outcomes.push(outcome);
        updates.extend(record.map(StatusUpdate::Generation));
    }

    let applied = outcomes.iter().filter(|o| o.applied).count();
    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    info!(applied, failed, "managed resources reconciled");

    updates.push(StatusUpdate::Condition(manifests_condition(&outcomes)));
    updates.push(StatusUpdate::ObservedGeneration(agent.metadata.generation));
    update_agent_status(ctx.kube.as_ref(), &name, &updates).await?;

    if let SyncOutcome::Busy = sync(&ctx, &name) {
        debug!("previous probe still running, next resync picks it up");
    }

    Ok(Action::requeue(ctx.config.resync_interval()))
}

async fn handle_deletion(agent: &TetherAgent, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(agent) {
        return Ok(Action::await_change());
    }

    info!("cleaning up managed resources");
    let templates = ManifestTemplates::new(manifest_values(agent, &ctx.config, SINGLE_REPLICA))?;
    let keys: Vec<&str> = DEPLOYMENT_MANIFESTS
        .iter()
        .chain(STATIC_MANIFESTS)
        .copied()
        .collect();
    ctx.engine.cleanup(&templates, &keys).await?;

    ctx.kube
        .remove_finalizer(&agent.name_any(), CLEANUP_FINALIZER)
        .await?;
    info!("cleanup complete, finalizer removed");
    Ok(Action::await_change())
}

/// Log the failure and schedule the next attempt.
///
/// Transient errors retry shortly. Errors that need changed inputs wait for
/// the regular resync instead of hammering the API server.
pub fn error_policy(agent: Arc<TetherAgent>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        agent = %agent.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::requeue(ctx.config.resync_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{
        AccessReviewer, MockHubClientFactory, MockSecretReader, PermissionProbe,
        HUB_CONNECTION_DEGRADED,
    };
    use crate::resources::testing::MemoryStore;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::discovery::ApiResource;
    use std::sync::Mutex;
    use tether_common::conditions::find_condition;
    use tether_common::crd::TetherAgentSpec;

    fn agent(finalizer: bool) -> TetherAgent {
        let mut agent = TetherAgent::new(
            "agent",
            TetherAgentSpec {
                cluster_name: Some("edge-01".to_string()),
                ..Default::default()
            },
        );
        agent.metadata.resource_version = Some("7".to_string());
        agent.metadata.generation = Some(2);
        if finalizer {
            agent.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        }
        agent
    }

    type Written = Arc<Mutex<Vec<TetherAgentStatus>>>;

    /// Agent client that serves `agent` and records every status write
    fn agent_client(agent: TetherAgent) -> (MockAgentClient, Written) {
        let written: Written = Arc::new(Mutex::new(Vec::new()));
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .returning(move |_| Ok(Some(agent.clone())));
        let sink = written.clone();
        kube.expect_patch_agent_status()
            .returning(move |_, _, status| {
                sink.lock().expect("lock").push(status.clone());
                Ok(())
            });
        kube.expect_list_nodes().returning(|| Ok(vec![]));
        (kube, written)
    }

    fn no_secrets() -> MockSecretReader {
        let mut secrets = MockSecretReader::new();
        secrets.expect_get_secret().returning(|_, _| Ok(None));
        secrets
    }

    fn context(kube: MockAgentClient, secrets: MockSecretReader) -> Arc<Context> {
        let mut clients = MockHubClientFactory::new();
        clients.expect_connect().times(0);
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MemoryStore::new()),
            Arc::new(secrets),
            Arc::new(clients),
        ))
    }

    fn started(outcome: SyncOutcome) -> JoinHandle<()> {
        match outcome {
            SyncOutcome::Started(handle) => handle,
            SyncOutcome::Busy => panic!("expected the probe to start"),
        }
    }

    #[test]
    fn manifests_condition_reports_every_failure() {
        let ok = manifests_condition(&[ApplyOutcome::success("a", "Secret", "s", true)]);
        assert_eq!(ok.status, ConditionStatus::True);

        let failed = manifests_condition(&[
            ApplyOutcome::success("a", "Secret", "s", true),
            ApplyOutcome::failure("b", "Kind1", "n1", Error::unsupported_kind("Kind1")),
        ]);
        assert_eq!(failed.status, ConditionStatus::False);
        assert_eq!(failed.reason, "ManifestApplyFailed");
        assert!(failed.message.starts_with("Kind1 \"n1\""));
    }

    #[tokio::test]
    async fn status_write_retries_after_conflict() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .times(2)
            .returning(|_| Ok(Some(agent(true))));
        let mut seq = mockall::Sequence::new();
        kube.expect_patch_agent_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(Error::conflict("TetherAgent", "agent")));
        kube.expect_patch_agent_status()
            .withf(|_, rv, _| rv == "7")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let condition = Condition::new("Ready", ConditionStatus::True, "R", "M");
        let written = update_agent_status(&kube, "agent", &[StatusUpdate::Condition(condition)])
            .await
            .expect("update");
        assert!(written);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let condition = Condition::new("Ready", ConditionStatus::True, "R", "M");
        let mut current = agent(true);
        current.status = Some(TetherAgentStatus {
            conditions: vec![condition.clone()],
            ..Default::default()
        });

        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .returning(move |_| Ok(Some(current.clone())));
        kube.expect_patch_agent_status().times(0);

        let written = update_agent_status(&kube, "agent", &[StatusUpdate::Condition(condition)])
            .await
            .expect("update");
        assert!(!written);
    }

    #[tokio::test]
    async fn status_of_deleted_agent_is_skipped() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent().returning(|_| Ok(None));
        kube.expect_patch_agent_status().times(0);

        let written = update_agent_status(&kube, "agent", &[StatusUpdate::ObservedGeneration(Some(1))])
            .await
            .expect("update");
        assert!(!written);
    }

    #[tokio::test]
    async fn non_conflict_errors_are_returned() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .times(1)
            .returning(|_| Ok(Some(agent(true))));
        kube.expect_patch_agent_status()
            .returning(|_, _, _| Err(Error::internal("boom")));

        let result =
            update_agent_status(&kube, "agent", &[StatusUpdate::ObservedGeneration(Some(3))]).await;
        assert!(result.is_err());
    }

    /// Story: a probe in flight turns away the next sync for the same agent
    #[tokio::test]
    async fn story_sync_is_exclusive_per_agent() {
        let (kube, written) = agent_client(agent(true));
        let ctx = context(kube, no_secrets());

        let handle = started(sync(&ctx, "agent"));
        assert!(matches!(sync(&ctx, "agent"), SyncOutcome::Busy));

        handle.await.expect("probe task");
        assert!(!ctx.guard.is_held("agent"));

        let statuses = written.lock().expect("lock");
        assert_eq!(statuses.len(), 1);
        let condition =
            find_condition(&statuses[0].conditions, HUB_CONNECTION_DEGRADED).expect("condition");
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(
            condition.reason,
            "BootstrapSecretMissing,HubKubeConfigSecretMissing"
        );
    }

    #[tokio::test]
    async fn other_agents_are_not_blocked() {
        let (kube, _) = agent_client(agent(true));
        let ctx = context(kube, no_secrets());

        let first = started(sync(&ctx, "agent"));
        let second = started(sync(&ctx, "other"));
        first.await.expect("probe task");
        second.await.expect("probe task");
    }

    struct HangingReviewer;

    #[async_trait]
    impl AccessReviewer for HangingReviewer {
        async fn review(&self, _probe: &PermissionProbe) -> Result<bool, Error> {
            std::future::pending().await
        }
    }

    fn hanging_context(kube: MockAgentClient) -> Arc<Context> {
        let mut secrets = MockSecretReader::new();
        secrets.expect_get_secret().returning(|ns, name| {
            let kubeconfig = "apiVersion: v1\nkind: Config\nclusters: []\ncontexts: []\nusers: []\n";
            Ok(Some(k8s_openapi::api::core::v1::Secret {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(ns.to_string()),
                    ..Default::default()
                },
                data: Some(
                    [(
                        "kubeconfig".to_string(),
                        k8s_openapi::ByteString(kubeconfig.as_bytes().to_vec()),
                    )]
                    .into(),
                ),
                ..Default::default()
            }))
        });
        let mut clients = MockHubClientFactory::new();
        clients
            .expect_connect()
            .returning(|_| Ok(Arc::new(HangingReviewer) as Arc<dyn AccessReviewer>));
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MemoryStore::new()),
            Arc::new(secrets),
            Arc::new(clients),
        ))
    }

    /// Story: a hung probe hits its deadline, writes nothing and frees the key
    #[tokio::test(start_paused = true)]
    async fn story_probe_deadline_releases_key_without_writing() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .returning(|_| Ok(Some(agent(true))));
        kube.expect_patch_agent_status().times(0);
        let ctx = hanging_context(kube);

        started(sync(&ctx, "agent")).await.expect("probe task");

        assert!(!ctx.guard.is_held("agent"));
    }

    #[tokio::test]
    async fn cancelled_probe_writes_nothing() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .returning(|_| Ok(Some(agent(true))));
        kube.expect_patch_agent_status().times(0);
        let ctx = hanging_context(kube);

        let handle = started(sync(&ctx, "agent"));
        ctx.cancel.cancel();
        handle.await.expect("probe task");

        assert!(!ctx.guard.is_held("agent"));
    }

    fn always_conflicting() -> MockAgentClient {
        let mut kube = MockAgentClient::new();
        kube.expect_get_agent()
            .returning(|_| Ok(Some(agent(true))));
        kube.expect_patch_agent_status()
            .returning(|_, _, _| Err(Error::conflict("TetherAgent", "agent")));
        kube
    }

    /// Story: a status write that never stops conflicting gives up at the deadline
    #[tokio::test(start_paused = true)]
    async fn story_conflicting_write_releases_key_at_deadline() {
        let ctx = context(always_conflicting(), no_secrets());

        let started_at = tokio::time::Instant::now();
        started(sync(&ctx, "agent")).await.expect("probe task");

        assert!(started_at.elapsed() >= ctx.config.probe_timeout());
        assert!(!ctx.guard.is_held("agent"));
        assert!(matches!(sync(&ctx, "agent"), SyncOutcome::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_conflicting_write() {
        let ctx = context(always_conflicting(), no_secrets());

        let handle = started(sync(&ctx, "agent"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(ctx.guard.is_held("agent"));

        ctx.cancel.cancel();
        handle.await.expect("probe task");
        assert!(!ctx.guard.is_held("agent"));
    }

    #[tokio::test]
    async fn missing_finalizer_is_added_first() {
        let mut kube = MockAgentClient::new();
        kube.expect_add_finalizer()
            .withf(|name, finalizer| name == "agent" && finalizer == CLEANUP_FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_agent_status().times(0);
        let ctx = context(kube, no_secrets());

        let action = reconcile(Arc::new(agent(false)), ctx)
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(FINALIZER_REQUEUE));
    }

    /// Story: a fresh agent gets its CRDs and Deployments and a status recording them
    #[tokio::test]
    async fn story_reconcile_applies_manifests_and_records_status() {
        let (kube, written) = agent_client(agent(true));
        let store = Arc::new(MemoryStore::new());
        let mut clients = MockHubClientFactory::new();
        clients.expect_connect().times(0);
        let ctx = Arc::new(Context::for_testing(
            Arc::new(kube),
            store.clone(),
            Arc::new(no_secrets()),
            Arc::new(clients),
        ));

        let action = reconcile(Arc::new(agent(true)), ctx.clone())
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let crds = ApiResource::erase::<CustomResourceDefinition>(&());
        assert!(store
            .object(&crds, None, "clusterclaims.cluster.open-cluster-management.io")
            .is_some());
        let deployments = ApiResource::erase::<Deployment>(&());
        assert!(store
            .object(&deployments, Some("tether-agent"), "registration-agent")
            .is_some());
        assert!(store
            .object(&deployments, Some("tether-agent"), "work-agent")
            .is_some());

        let status = written.lock().expect("lock")[0].clone();
        let applied = find_condition(&status.conditions, MANIFESTS_APPLIED).expect("condition");
        assert_eq!(applied.status, ConditionStatus::True, "{}", applied.message);
        assert_eq!(status.generations.len(), 2);
        assert_eq!(status.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn deletion_cleans_up_then_releases_finalizer() {
        let mut deleting = agent(true);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut kube = MockAgentClient::new();
        kube.expect_remove_finalizer()
            .withf(|name, finalizer| name == "agent" && finalizer == CLEANUP_FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = context(kube, no_secrets());

        let action = reconcile(Arc::new(deleting), ctx).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn error_policy_requeues_after_five_seconds() {
        let kube = MockAgentClient::new();
        let ctx = context(kube, no_secrets());
        let action = error_policy(Arc::new(agent(true)), &Error::internal("boom"), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    #[test]
    fn permanent_errors_wait_for_the_resync() {
        let kube = MockAgentClient::new();
        let ctx = context(kube, no_secrets());
        let action = error_policy(
            Arc::new(agent(true)),
            &Error::manifest("registration-deployment.yaml", "template error"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(ctx.config.resync_interval()));
    }
}
