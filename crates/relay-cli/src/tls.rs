//! Shared TLS connector builder for the CLI's two WebSocket clients
//! (`proxy` and `login`'s callback redirect never needs TLS, but `proxy`
//! does) — same pinning idiom as `relay-agent::control`.

use std::sync::Arc;

pub fn build_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        if let Ok(pem_data) = std::fs::read(cert_path) {
            for cert in rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()) {
                let _ = root_store.add(cert);
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}
