//! Controller wiring for TetherAgents

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use tether_common::crd::TetherAgent;
use tether_common::{BOOTSTRAP_KUBECONFIG_SECRET, HUB_KUBECONFIG_SECRET};

use crate::config::OperatorConfig;
use crate::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the TetherAgent controller until a shutdown signal arrives.
///
/// Changes to a credential secret requeue every agent running in the
/// secret's namespace. In-flight probes are cancelled on shutdown.
pub async fn run(client: Client, config: OperatorConfig) {
    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context::new(client.clone(), config, cancel.clone()));

    let agents: Api<TetherAgent> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    let controller = Controller::new(agents, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS));
    let store = controller.store();

    tracing::info!("- TetherAgent controller");
    controller
        .watches(
            secrets,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |secret| agents_for_secret(&store.state(), &secret),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("TetherAgent"))
        .await;

    cancel.cancel();
    tracing::info!("controller stopped");
}

/// Agents whose credentials live in `secret`
pub fn agents_for_secret(
    agents: &[Arc<TetherAgent>],
    secret: &Secret,
) -> Vec<ObjectRef<TetherAgent>> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    if name != HUB_KUBECONFIG_SECRET && name != BOOTSTRAP_KUBECONFIG_SECRET {
        return vec![];
    }
    let Some(namespace) = secret.metadata.namespace.as_deref() else {
        return vec![];
    };

    agents
        .iter()
        .filter(|agent| agent.agent_namespace() == namespace)
        .map(|agent| ObjectRef::from_obj(agent.as_ref()))
        .collect()
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
