//! Tether operator - keeps a managed cluster's agent connected to its hub

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use tether_common::crd::TetherAgent;
use tether_common::kube_utils::create_client;
use tether_common::retry::{retry_with_backoff, RetryConfig};
use tether_common::telemetry::{init_telemetry, TelemetryConfig};
use tether_common::FIELD_MANAGER;
use tether_operator::{runner, OperatorConfig};

/// Tether - agent-side operator for hub-connected clusters
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TetherAgent::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::for_service("tether-operator"))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = create_client(config.kubeconfig.as_deref()).await?;

    retry_with_backoff(&RetryConfig::with_max_attempts(10), "install_crd", || {
        ensure_crd_installed(&client)
    })
    .await?;

    runner::run(client, config).await;
    Ok(())
}

/// Install the TetherAgent CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing TetherAgent CRD...");
    crds.patch(
        "tetheragents.tether.dev",
        &params,
        &Patch::Apply(&TetherAgent::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TetherAgent CRD: {}", e))?;
    Ok(())
}
