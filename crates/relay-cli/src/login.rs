//! `relay login`: a public-client OIDC authorization-code + PKCE flow
//! against the identity provider directly (no client secret — the CLI
//! can't keep one), with the redirect caught by a one-shot local HTTP
//! listener, grounded on the same `oauth2` crate the gateway's
//! browser flow uses in `relay-server::oidc`.

use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CALLBACK_PORT: u16 = 18732;

pub async fn run(issuer: &str, client_id: &str) -> anyhow::Result<()> {
    let issuer = issuer.trim_end_matches('/');
    let redirect_url = format!("http://127.0.0.1:{CALLBACK_PORT}/callback");

    let client = BasicClient::new(
        ClientId::new(client_id.to_string()),
        None,
        AuthUrl::new(format!("{issuer}/authorize"))?,
        Some(TokenUrl::new(format!("{issuer}/token"))?),
    )
    .set_redirect_uri(RedirectUrl::new(redirect_url)?);

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let (auth_url, csrf_token) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new("openid".into()))
        .add_scope(Scope::new("profile".into()))
        .set_pkce_challenge(pkce_challenge)
        .url();

    println!("Open this URL in a browser to log in:\n\n  {auth_url}\n");
    println!("Waiting for the callback on 127.0.0.1:{CALLBACK_PORT}...");

    let (code, state) = wait_for_callback().await?;
    if state != *csrf_token.secret() {
        anyhow::bail!("CSRF state mismatch; aborting login");
    }

    let token = client
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(pkce_verifier)
        .request_async(oauth2::reqwest::async_http_client)
        .await?;

    crate::token_store::save(token.access_token().secret())?;
    println!("Logged in. Token saved.");
    Ok(())
}

async fn wait_for_callback() -> anyhow::Result<(String, String)> {
    let listener = TcpListener::bind(("127.0.0.1", CALLBACK_PORT)).await?;
    let (mut socket, _) = listener.accept().await?;

    let mut buf = vec![0u8; 8192];
    let n = socket.read(&mut buf).await?;
    let request_line = String::from_utf8_lossy(&buf[..n]);
    let path = request_line
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| anyhow::anyhow!("malformed callback request"))?;

    let query = path.split_once('?').map(|(_, q)| q).unwrap_or_default();
    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            let v = urlencoding::decode(v).unwrap_or_default().into_owned();
            match k {
                "code" => code = Some(v),
                "state" => state = Some(v),
                _ => {}
            }
        }
    }

    let body = "Login complete, you can close this tab.";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;

    Ok((
        code.ok_or_else(|| anyhow::anyhow!("callback missing `code`"))?,
        state.ok_or_else(|| anyhow::anyhow!("callback missing `state`"))?,
    ))
}
