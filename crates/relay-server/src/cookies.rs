//! SessionCookie store (§3): process-local, bounded, LRU-evicted. On
//! eviction the user must re-authenticate via the OIDC redirect flow —
//! there is no persistence across restarts, a deliberate choice; see
//! DESIGN.md.

use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use relay_protocol::UserPrincipal;
use std::num::NonZeroUsize;

#[derive(Clone)]
struct Entry {
    principal: UserPrincipal,
    expires_at: u64,
}

pub struct CookieStore {
    inner: Mutex<LruCache<String, Entry>>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl CookieStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Mints an opaque cookie value bound to `principal`, expiring at
    /// `min(requested_ttl, token_expiry)` — cookie validity must never
    /// outlive the token it was minted from (§3 invariant).
    pub fn mint(&self, principal: UserPrincipal, ttl_secs: u64) -> (String, u64) {
        let expires_at = (now_secs() + ttl_secs).min(principal.expiry);
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.lock().put(
            id.clone(),
            Entry {
                principal,
                expires_at,
            },
        );
        (id, expires_at)
    }

    /// Resolves a cookie to a principal. Expired cookies are evicted and
    /// resolve to `None` (the caller maps this to `Unauthenticated`).
    pub fn resolve(&self, cookie: &str) -> Option<UserPrincipal> {
        let mut guard = self.inner.lock();
        let entry = guard.get(cookie)?.clone();
        if entry.expires_at <= now_secs() {
            guard.pop(cookie);
            return None;
        }
        Some(entry.principal)
    }

    pub fn evict(&self, cookie: &str) {
        self.inner.lock().pop(cookie);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(expiry: u64) -> UserPrincipal {
        UserPrincipal {
            subject: "sub".into(),
            owner: "alpha".into(),
            roles: vec![],
            expiry,
        }
    }

    #[test]
    fn mint_then_resolve_round_trips() {
        let store = CookieStore::new(10);
        let (cookie, _exp) = store.mint(principal(now_secs() + 3600), 600);
        let resolved = store.resolve(&cookie).unwrap();
        assert_eq!(resolved.owner, "alpha");
    }

    #[test]
    fn cookie_validity_never_exceeds_token_expiry() {
        let store = CookieStore::new(10);
        let token_expiry = now_secs() + 10;
        let (_cookie, expires_at) = store.mint(principal(token_expiry), 3600);
        assert!(expires_at <= token_expiry);
    }

    #[test]
    fn lru_eviction_drops_oldest_when_full() {
        let store = CookieStore::new(2);
        let (c1, _) = store.mint(principal(now_secs() + 3600), 600);
        let (_c2, _) = store.mint(principal(now_secs() + 3600), 600);
        let (_c3, _) = store.mint(principal(now_secs() + 3600), 600);
        assert_eq!(store.len(), 2);
        assert!(store.resolve(&c1).is_none());
    }

    #[test]
    fn evicted_cookie_requires_reauth() {
        let store = CookieStore::new(10);
        let (cookie, _) = store.mint(principal(now_secs() + 3600), 600);
        store.evict(&cookie);
        assert!(store.resolve(&cookie).is_none());
    }
}
