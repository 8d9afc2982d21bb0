//! Identity Verifier (§4.A): fetches and caches the OIDC issuer's signing
//! keys, validates bearer tokens, and extracts the `owner` claim other
//! components use for ownership checks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use relay_protocol::UserPrincipal;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("malformed token")]
    Malformed,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("token expired")]
    Expired,
    #[error("issuer unknown or signing key not found")]
    IssuerUnknown,
    #[error("required claims missing")]
    ClaimsMissing,
}

impl From<VerifyError> for relay_protocol::ErrorKind {
    fn from(_: VerifyError) -> Self {
        relay_protocol::ErrorKind::Unauthenticated
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    exp: u64,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

struct JwkCache {
    set: JwkSet,
    #[allow(dead_code)]
    fetched_at: Instant,
}

pub struct IdentityVerifier {
    issuer: String,
    audience: Option<String>,
    owner_claim: String,
    http: reqwest::Client,
    cache: ArcSwap<JwkCache>,
}

impl IdentityVerifier {
    pub async fn new(
        issuer: String,
        audience: Option<String>,
        owner_claim: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let set = fetch_jwks(&http, &issuer).await?;
        Ok(Self {
            issuer,
            audience,
            owner_claim,
            http,
            cache: ArcSwap::from_pointee(JwkCache {
                set,
                fetched_at: Instant::now(),
            }),
        })
    }

    /// Background refresh cycle (default 10 min per §4.A). Network failures
    /// leave the existing snapshot in place.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // first tick fires immediately; skip it, we already fetched in `new`
            loop {
                tick.tick().await;
                match fetch_jwks(&this.http, &this.issuer).await {
                    Ok(set) => this.cache.store(Arc::new(JwkCache {
                        set,
                        fetched_at: Instant::now(),
                    })),
                    Err(e) => {
                        tracing::warn!(error = %e, "jwks refresh failed, keeping previous snapshot")
                    }
                }
            }
        })
    }

    pub async fn verify(&self, token: &str) -> Result<UserPrincipal, VerifyError> {
        let header = decode_header(token).map_err(|_| VerifyError::Malformed)?;
        let kid = header.kid.ok_or(VerifyError::Malformed)?;

        let mut jwk = self.cache.load().set.find(&kid).cloned();
        if jwk.is_none() {
            if let Ok(set) = fetch_jwks(&self.http, &self.issuer).await {
                jwk = set.find(&kid).cloned();
                self.cache.store(Arc::new(JwkCache {
                    set,
                    fetched_at: Instant::now(),
                }));
            }
        }
        let jwk = jwk.ok_or(VerifyError::IssuerUnknown)?;

        let decoding_key = DecodingKey::from_jwk(&jwk).map_err(|_| VerifyError::Malformed)?;
        let mut validation = Validation::new(header.alg);
        if let Some(aud) = &self.audience {
            validation.set_audience(&[aud]);
        }
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<RawClaims>(token, &decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
                _ => VerifyError::Malformed,
            }
        })?;

        let claims = data.claims;
        let owner = resolve_owner(&claims.extra, &self.owner_claim, &claims.sub)
            .ok_or(VerifyError::ClaimsMissing)?;

        Ok(UserPrincipal {
            subject: claims.sub,
            owner,
            roles: claims.roles,
            expiry: claims.exp,
        })
    }
}

/// `owner` claim, falling back to `preferred_username` then `sub` (this
/// fallback order is a deliberate choice; see DESIGN.md).
fn resolve_owner(
    extra: &serde_json::Map<String, serde_json::Value>,
    owner_claim: &str,
    subject: &str,
) -> Option<String> {
    extra
        .get(owner_claim)
        .and_then(|v| v.as_str())
        .or_else(|| extra.get("preferred_username").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .or_else(|| Some(subject.to_string()))
}

async fn fetch_jwks(http: &reqwest::Client, issuer: &str) -> anyhow::Result<JwkSet> {
    let url = format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/'));
    let set = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<JwkSet>()
        .await?;
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn resolves_configured_owner_claim() {
        let extra = obj(&[("owner", "alpha"), ("preferred_username", "alpha@example.com")]);
        assert_eq!(resolve_owner(&extra, "owner", "sub1").as_deref(), Some("alpha"));
    }

    #[test]
    fn falls_back_to_preferred_username() {
        let extra = obj(&[("preferred_username", "alpha")]);
        assert_eq!(resolve_owner(&extra, "owner", "sub1").as_deref(), Some("alpha"));
    }

    #[test]
    fn falls_back_to_subject() {
        let extra = obj(&[]);
        assert_eq!(resolve_owner(&extra, "owner", "sub1").as_deref(), Some("sub1"));
    }
}
