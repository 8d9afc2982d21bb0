//! Browser-facing OIDC authorization-code flow (§4.D HTTP surface).
//!
//! Assumes the issuer exposes the two authorization-code endpoints directly
//! at `<issuer>/authorize` and `<issuer>/token` rather than running OIDC
//! discovery (`/.well-known/openid-configuration`) — a simplification noted
//! in DESIGN.md, not a spec requirement.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};

const PENDING_TTL: Duration = Duration::from_secs(600);

struct PendingAuth {
    pkce_verifier: PkceCodeVerifier,
    original_url: String,
    created_at: Instant,
}

pub struct OidcClient {
    client: BasicClient,
    pending: Mutex<HashMap<String, PendingAuth>>,
}

impl OidcClient {
    pub fn new(
        issuer: &str,
        client_id: String,
        client_secret: String,
        redirect_url: String,
    ) -> anyhow::Result<Self> {
        let issuer = issuer.trim_end_matches('/');
        let client = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(format!("{issuer}/authorize"))?,
            Some(TokenUrl::new(format!("{issuer}/token"))?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_url)?);

        Ok(Self {
            client,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the authorization-code + PKCE flow, returning the URL to
    /// redirect the browser to. `original_url` is the request the user was
    /// trying to reach before the `401`; it's replayed after the callback.
    pub fn begin(&self, original_url: String) -> String {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new("openid".into()))
            .add_scope(Scope::new("profile".into()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, p| p.created_at.elapsed() < PENDING_TTL);
        pending.insert(
            csrf_token.secret().clone(),
            PendingAuth {
                pkce_verifier,
                original_url,
                created_at: Instant::now(),
            },
        );
        auth_url.to_string()
    }

    /// Exchanges the callback's authorization code for an access token,
    /// returning it alongside the original URL to redirect back to.
    pub async fn exchange(&self, state: &str, code: String) -> anyhow::Result<(String, String)> {
        let pending = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .remove(state)
                .ok_or_else(|| anyhow::anyhow!("unknown or expired oidc state"))?
        };

        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pending.pkce_verifier)
            .request_async(oauth2::reqwest::async_http_client)
            .await?;

        Ok((pending.original_url, token.access_token().secret().clone()))
    }
}
