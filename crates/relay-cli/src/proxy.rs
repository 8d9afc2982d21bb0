//! `relay proxy <identity>`: dials the User Gateway's stdio-over-WebSocket
//! surface and bridges it to the process's own stdin/stdout, so the
//! command can be used directly as an SSH `ProxyCommand`.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::Message;

pub async fn run(server: &str, identity: &str, tls_cert: Option<&str>) -> anyhow::Result<()> {
    let token = crate::token_store::load()?;

    let mut request = format!("{server}/v1/proxy").into_client_request()?;
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {token}").parse()?);
    request.headers_mut().insert("x-relay-identity", identity.parse()?);

    let connector = crate::tls::build_connector(tls_cert);
    let (ws_stream, response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector)).await?;
    if response.status().is_client_error() || response.status().is_server_error() {
        anyhow::bail!("gateway rejected the connection: {}", response.status());
    }

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let stdin_to_ws = async {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_sink.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sink.close().await;
    };

    let ws_to_stdout = async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                Message::Binary(bytes) => {
                    if stdout.write_all(&bytes).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::join!(stdin_to_ws, ws_to_stdout);
    Ok(())
}
