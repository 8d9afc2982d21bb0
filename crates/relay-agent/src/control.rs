//! Agent half of the control channel (§4.C registration, §4.B streams).
//!
//! Dials the relay, authenticates with a bearer token and the desired
//! `AgentIdentity`, then loops `Session::accept()` and bridges every
//! accepted stream to a local TCP target. Reconnects with exponential
//! backoff on any failure.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_mux::{MuxTransport, Role, Session, TransportError};
use relay_protocol::Frame;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{info, warn};

pub(crate) struct AgentConfig {
    pub server_url: String,
    pub identity: String,
    pub agent_token: Option<String>,
    pub tls_cert_path: Option<String>,
    pub local_target: String,
}

/// Adapts a `tokio_tungstenite` client socket to [`MuxTransport`].
struct WsTransport(tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>);

impl MuxTransport for WsTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(frame.encode().to_vec().into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Frame::decode(&bytes)?)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("failed to add pinned cert to root store: {e}");
                    } else {
                        info!("pinned relay certificate from {cert_path}");
                    }
                }
            }
            Err(e) => warn!("failed to read TLS cert from {cert_path}: {e}, using system roots"),
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

/// Runs the control connection forever, reconnecting with exponential
/// backoff (2s..60s) on any error.
pub(crate) async fn run(config: AgentConfig) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);

    loop {
        info!(url = %config.server_url, identity = %config.identity, "connecting to relay control channel");
        match connect_and_serve(&config).await {
            Ok(()) => {
                info!("control channel closed cleanly");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                warn!("control channel error: {e:#}");
            }
        }
        info!("reconnecting in {}s", backoff.as_secs());
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn connect_and_serve(config: &AgentConfig) -> anyhow::Result<()> {
    let mut request = format!("{}/v1/control", config.server_url).into_client_request()?;
    if let Some(token) = &config.agent_token {
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, format!("Bearer {token}").parse()?);
    }
    request
        .headers_mut()
        .insert("x-relay-identity", config.identity.parse()?);

    let connector = build_tls_connector(config.tls_cert_path.as_deref());
    let (ws_stream, _) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector)).await?;

    info!("control channel established");
    let (session, _join) = Session::new(WsTransport(ws_stream), Role::Odd);

    while let Some(stream) = session.accept().await {
        let local_target = config.local_target.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge_to_local(stream, &local_target).await {
                warn!("stream bridge error: {e:#}");
            }
        });
    }
    info!("session gone, stream acceptor closed");

    Ok(())
}

async fn bridge_to_local(mut stream: relay_mux::MuxStream, local_target: &str) -> anyhow::Result<()> {
    let mut tcp = TcpStream::connect(local_target).await?;
    tokio::io::copy_bidirectional(&mut stream, &mut tcp).await?;
    Ok(())
}
