mod desired;
mod orchestrator;
mod reconcile;
mod registry_client;
mod ttl;
mod wake;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::{watcher, Controller};
use relay_protocol::{load_config, RelayConfig, WorkspaceAgent};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::orchestrator::KubeOrchestrator;
use crate::reconcile::Context;
use crate::registry_client::AgentRegistryClient;
use crate::wake::WakeState;

fn parse_args() -> PathBuf {
    std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./config/relay.toml"))
}

fn default_agent_image() -> String {
    std::env::var("RELAY_AGENT_IMAGE").unwrap_or_else(|_| "relaytun/relay-agent:latest".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_args();
    let config: RelayConfig = load_config(config_path.to_str().unwrap_or_default())?;

    let agent_server_url = config
        .controller
        .agent_server_url
        .clone()
        .context("controller.agent_server_url must be set (relay-server's management interface base URL)")?;

    let kube_client = kube::Client::try_default().await.context("building kubernetes client")?;
    let orchestrator = KubeOrchestrator::new(kube_client.clone());
    let registry_client = AgentRegistryClient::new(agent_server_url);
    let identity_index = Arc::new(DashMap::new());

    let ctx = Arc::new(Context::new(
        orchestrator,
        registry_client,
        default_agent_image(),
        Duration::from_secs(config.controller.reconcile_tick_secs),
        identity_index,
        config.controller.wake_grace_secs,
    ));

    let api: Api<WorkspaceAgent> = Api::all(kube_client.clone());
    let controller = Controller::new(api, watcher::Config::default())
        .run(reconcile::reconcile, reconcile::error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => tracing::debug!(?obj_ref, ?action, "reconciled"),
                Err(err) => tracing::warn!(%err, "reconcile error surfaced from controller runtime"),
            }
        });

    let wake_state = Arc::new(WakeState::new(ctx));
    let wake_port = std::env::var("RELAY_CONTROLLER_WAKE_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(9100u16);
    let wake_app = Router::new()
        .route("/v1/agents/{identity_action}", post(wake::wake::<KubeOrchestrator>))
        .with_state(wake_state);

    let listener = TcpListener::bind(("0.0.0.0", wake_port)).await.context("binding wake listener")?;
    tracing::info!(port = wake_port, "wake endpoint listening");
    let wake_server = async {
        if let Err(err) = axum::serve(listener, wake_app).await {
            tracing::error!(%err, "wake server exited");
        }
    };

    tokio::select! {
        _ = controller => {
            tracing::warn!("reconcile controller stream ended");
        }
        _ = wake_server => {
            tracing::warn!("wake server ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    Ok(())
}
