//! OAuth store (C12): a minimal per-(server, audience, resource) token
//! lookup with expiry and audience/resource validation, plus a step-up
//! challenge retry counter. The core consumes tokens from this store; it
//! does not implement authorization-code/PKCE negotiation (out of scope
//! per the system's purpose), unlike the grounding crate's full `oauth2`
//! module which performs that exchange end to end.

use crate::error::{ProxyError, ProxyResult};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// One stored access token, scoped to the (server, audience, resource)
/// triple it was issued for.
struct TokenRecord {
    access: SecretString,
    resource: Option<String>,
    scope: Option<String>,
    expires_at: u64,
}

const STEP_UP_RETRY_CAP: u32 = 3;

/// Per-server, per-audience token cache with expiry and a step-up retry
/// budget. Not a full OAuth client: callers hand it tokens acquired
/// elsewhere and ask it whether a given (server, audience, resource) call
/// may proceed.
pub struct OAuthStore {
    tokens: DashMap<(String, String), TokenRecord>,
    /// Tracks the same access token string across servers, to detect reuse.
    token_owners: DashMap<String, String>,
    step_up_attempts: DashMap<(String, String), u32>,
}

impl OAuthStore {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            token_owners: DashMap::new(),
            step_up_attempts: DashMap::new(),
        }
    }

    /// Stores an access token for `(server, audience)`, scoped to an
    /// optional `resource` and `scope`, expiring after `ttl_sec`. Fails if
    /// `server` or `audience` is empty, or if the same access token is
    /// already bound to a different server (tokens are never reusable
    /// across servers).
    pub fn store_token(
        &self,
        server: &str,
        access: impl Into<String>,
        audience: &str,
        resource: Option<String>,
        scope: Option<String>,
        ttl_sec: u64,
    ) -> ProxyResult<()> {
        if server.is_empty() || audience.is_empty() {
            return Err(ProxyError::invalid_params("server and audience must be non-empty"));
        }
        let access = access.into();
        self.check_token_reuse(server, &access)?;
        self.token_owners.insert(access.clone(), server.to_string());
        self.tokens.insert(
            (server.to_string(), audience.to_string()),
            TokenRecord {
                access: SecretString::from(access),
                resource,
                scope,
                expires_at: now_unix() + ttl_sec,
            },
        );
        Ok(())
    }

    fn check_token_reuse(&self, server: &str, access: &str) -> ProxyResult<()> {
        if let Some(owner) = self.token_owners.get(access) {
            if owner.value() != server {
                return Err(ProxyError::TokenReuseDetected);
            }
        }
        Ok(())
    }

    /// Returns the stored access token if it is unexpired and exactly
    /// matches the `(audience, resource)` pair it was stored for.
    pub fn get_token(&self, server: &str, audience: &str, resource: Option<&str>) -> ProxyResult<String> {
        Ok(self.get_token_with_scope(server, audience, resource)?.0)
    }

    /// Like [`Self::get_token`] but also returns the scope the token was
    /// stored with, for callers that need to present it in a step-up
    /// challenge or an audit entry.
    pub fn get_token_with_scope(&self, server: &str, audience: &str, resource: Option<&str>) -> ProxyResult<(String, Option<String>)> {
        let record = self
            .tokens
            .get(&(server.to_string(), audience.to_string()))
            .ok_or(ProxyError::TokenNotFound)?;
        if record.expires_at <= now_unix() {
            return Err(ProxyError::TokenExpired);
        }
        if record.resource.as_deref() != resource {
            return Err(ProxyError::ResourceMismatch);
        }
        Ok((record.access.expose_secret().to_string(), record.scope.clone()))
    }

    /// Fails if the same access token string is already stored against a
    /// different server than `server_b` claims (used when two backends
    /// attempt to present what looks like the same credential).
    pub fn check_token_reuse_across(&self, server_a: &str, server_b: &str, audience: &str) -> ProxyResult<()> {
        let a = self.tokens.get(&(server_a.to_string(), audience.to_string()));
        let b = self.tokens.get(&(server_b.to_string(), audience.to_string()));
        if let (Some(a), Some(b)) = (a, b) {
            if a.access.expose_secret() == b.access.expose_secret() {
                return Err(ProxyError::TokenReuseDetected);
            }
        }
        Ok(())
    }

    /// Records one step-up challenge attempt for `(server, scope)`. Returns
    /// `StepUpRetriesExceeded` once the attempt count exceeds the retry
    /// cap of 3; a subsequent deny resets the window.
    pub fn record_step_up_attempt(&self, server: &str, scope: &str) -> ProxyResult<()> {
        let key = (server.to_string(), scope.to_string());
        let mut count = self.step_up_attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count > STEP_UP_RETRY_CAP {
            Err(ProxyError::StepUpRetriesExceeded)
        } else {
            Ok(())
        }
    }

    /// Resets the step-up retry window for `(server, scope)` after a deny.
    pub fn reset_step_up_window(&self, server: &str, scope: &str) {
        self.step_up_attempts.remove(&(server.to_string(), scope.to_string()));
    }
}

impl Default for OAuthStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_unexpired_token() {
        let store = OAuthStore::new();
        store.store_token("demo", "tok-1", "aud-1", Some("res-1".to_string()), None, 60).unwrap();
        let token = store.get_token("demo", "aud-1", Some("res-1")).unwrap();
        assert_eq!(token, "tok-1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let store = OAuthStore::new();
        store.store_token("demo", "tok-1", "aud-1", None, None, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(store.get_token("demo", "aud-1", None), Err(ProxyError::TokenExpired)));
    }

    #[test]
    fn resource_mismatch_is_rejected() {
        let store = OAuthStore::new();
        store.store_token("demo", "tok-1", "aud-1", Some("res-1".to_string()), None, 60).unwrap();
        assert!(matches!(
            store.get_token("demo", "aud-1", Some("res-2")),
            Err(ProxyError::ResourceMismatch)
        ));
    }

    #[test]
    fn missing_token_is_not_found() {
        let store = OAuthStore::new();
        assert!(matches!(store.get_token("demo", "aud-1", None), Err(ProxyError::TokenNotFound)));
    }

    #[test]
    fn same_token_across_two_servers_is_reuse() {
        let store = OAuthStore::new();
        store.store_token("demo-a", "shared-tok", "aud-1", None, None, 60).unwrap();
        let err = store.store_token("demo-b", "shared-tok", "aud-1", None, None, 60).unwrap_err();
        assert!(matches!(err, ProxyError::TokenReuseDetected));
    }

    #[test]
    fn step_up_retries_exceed_cap() {
        let store = OAuthStore::new();
        for _ in 0..3 {
            store.record_step_up_attempt("demo", "write").unwrap();
        }
        let err = store.record_step_up_attempt("demo", "write").unwrap_err();
        assert!(matches!(err, ProxyError::StepUpRetriesExceeded));
    }

    #[test]
    fn reset_clears_the_retry_window() {
        let store = OAuthStore::new();
        for _ in 0..3 {
            store.record_step_up_attempt("demo", "write").unwrap();
        }
        store.reset_step_up_window("demo", "write");
        assert!(store.record_step_up_attempt("demo", "write").is_ok());
    }
}
