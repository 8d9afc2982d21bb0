mod control;
mod cookies;
mod gateway_http;
mod gateway_stdio;
mod identity;
mod mgmt_api;
mod oidc;
mod registry;
mod respond;
mod state;
mod tls;
mod wake;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{any, get};
use axum::Router;
use relay_protocol::{load_config, RelayConfig};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cookies::CookieStore;
use crate::identity::IdentityVerifier;
use crate::oidc::OidcClient;
use crate::registry::AgentRegistry;
use crate::state::{AppState, Metrics};
use crate::wake::WakeClient;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/relay.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/control", any(control::control))
        .route("/v1/proxy", any(gateway_stdio::proxy))
        .route("/auth/callback", get(gateway_http::auth_callback))
        .route("/v1/agents", get(mgmt_api::list_agents))
        .route("/v1/agents/{identity}", get(mgmt_api::get_agent))
        .fallback(any(gateway_http::dispatch))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = load_config(config_path.to_string_lossy().as_ref())?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    let issues = config.validate();
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{issue}");
        } else {
            tracing::warn!("{issue}");
        }
    }
    if RelayConfig::has_fatal_issues(&issues) {
        tracing::error!(
            "Configuration has {} fatal issue(s); fix them and restart",
            issues.iter().filter(|i| i.starts_with("ERROR:")).count()
        );
        std::process::exit(1);
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let tls_result = tls::build_tls_config(config.server.tls_cert.as_deref(), config.server.tls_key.as_deref())?;
    let tls_acceptor = tls::make_acceptor(tls_result.config);

    let issuer = config
        .oidc
        .issuer_url
        .clone()
        .context("oidc.issuer_url is required")?;
    let client_id = config.oidc.client_id.clone().context("oidc.client_id is required")?;
    let client_secret = config
        .oidc
        .client_secret
        .clone()
        .context("oidc.client_secret is required")?;

    let verifier = Arc::new(
        IdentityVerifier::new(
            issuer.clone(),
            Some(client_id.clone()),
            config.oidc.owner_claim.clone(),
            Duration::from_secs(config.oidc.timeout_secs),
        )
        .await
        .context("fetching initial JWKS snapshot")?,
    );
    verifier.spawn_refresh(Duration::from_secs(config.oidc.jwks_refresh_secs));

    let redirect_url = format!("{}/auth/callback", config.server.public_url.trim_end_matches('/'));
    let oidc = Arc::new(OidcClient::new(&issuer, client_id, client_secret, redirect_url)?);

    let registry = AgentRegistry::new(config.registry.max_streams_per_agent);
    let cookies = Arc::new(CookieStore::new(config.registry.cookie_store_capacity));
    let wake = Arc::new(WakeClient::new(config.controller.wake_url.clone()));

    let state = AppState {
        config: Arc::new(config),
        registry,
        verifier,
        cookies,
        oidc,
        wake,
        started_at: std::time::Instant::now(),
        metrics: Arc::new(Metrics::default()),
    };

    let registry_for_shutdown = state.registry.clone();

    let app = build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  relaytun relay server");
    tracing::info!("  listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("failed to accept tcp connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "tls handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "tls handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    tracing::info!("draining live agent sessions");
    registry_for_shutdown.drain().await;

    tracing::info!("relay server shut down cleanly");
    Ok(())
}
