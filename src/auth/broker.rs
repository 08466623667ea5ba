//! Token broker: hands out cached delegated and application-only tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use url::Url;

use super::credentials::validate_app_credentials;
use super::oauth::{OAuth2Client, PkceChallenge};
use super::secure::SecureString;
use super::store::{application_key, delegated_key, principal_prefix, TokenStore};
use super::token::{decode_claims, AccessToken, TokenKind};
use crate::config::Config;
use crate::context::{Principal, RequestContext};
use crate::error::BrokerError;
use crate::permissions::{check_static_permission, PermissionKind};

/// Produces valid access tokens while minimizing round-trips to Azure AD.
///
/// Cache hits never block. A miss or an expired entry takes a per-key lock and
/// re-reads the store before contacting the identity provider, so concurrent
/// requests for the same key trigger a single refresh.
pub struct TokenBroker {
    config: Arc<Config>,
    oauth: OAuth2Client,
    store: Arc<dyn TokenStore>,
    refresh_skew: Duration,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TokenBroker {
    pub fn new(config: Arc<Config>, store: Arc<dyn TokenStore>) -> Result<Self, BrokerError> {
        let oauth = OAuth2Client::new(&config)?;
        let refresh_skew = Duration::seconds(config.token.refresh_before_expiry_seconds as i64);
        Ok(Self {
            config,
            oauth,
            store,
            refresh_skew,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Give back the lock of `key`; it is forgotten once no other task holds or awaits it.
    fn release_key_lock(&self, key: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    fn cached(&self, key: &str) -> Result<Option<AccessToken>, BrokerError> {
        Ok(self
            .store
            .get(key)?
            .filter(|token| !token.is_expired(self.refresh_skew)))
    }

    /// Get a delegated token for the signed-in principal of `ctx`.
    ///
    /// Without a cached token for `scope`, the principal's most recent refresh
    /// token is redeemed for the new scope. Without any refresh token the
    /// principal has to sign in interactively.
    pub async fn get_access_token(
        &self,
        ctx: &RequestContext,
        scope: &str,
    ) -> Result<AccessToken, BrokerError> {
        let principal = ctx.principal.as_ref().ok_or_else(|| {
            BrokerError::Unauthorized("no signed-in user; interactive sign-in required".into())
        })?;
        let key = delegated_key(&principal.id, scope);

        if let Some(token) = self.cached(&key)? {
            debug!("Delegated token cache hit for {}", scope);
            return Ok(token);
        }

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_delegated(principal, &key, scope).await
        };
        self.release_key_lock(&key, lock);
        result
    }

    /// Refresh path of [`Self::get_access_token`]; the caller holds the key lock.
    async fn refresh_delegated(
        &self,
        principal: &Principal,
        key: &str,
        scope: &str,
    ) -> Result<AccessToken, BrokerError> {
        // Another request may have refreshed while we waited.
        let existing = self.store.get(key)?;
        if let Some(token) = existing.as_ref().filter(|t| !t.is_expired(self.refresh_skew)) {
            return Ok(token.clone());
        }

        let refresh_token = match existing.as_ref().and_then(|t| t.refresh_token.clone()) {
            Some(refresh_token) => refresh_token,
            None => match self.latest_refresh_token(principal)? {
                Some(refresh_token) => refresh_token,
                None => {
                    if existing.is_some() {
                        self.store.remove(key)?;
                    }
                    return Err(BrokerError::Unauthorized(format!(
                        "no delegated token for {scope}; {} must sign in",
                        principal.upn
                    )));
                }
            },
        };

        info!("Refreshing delegated token for {} ({})", principal.upn, scope);
        match self.oauth.refresh_token(refresh_token.as_str(), scope).await {
            Ok(response) => {
                let mut fresh = AccessToken::from_response(TokenKind::Delegated, scope, &response);
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = Some(refresh_token);
                }
                self.store.put(key, &fresh)?;
                Ok(fresh)
            }
            Err(e) if e.is_retryable() => {
                warn!("Refresh for {} deferred: {}", scope, e);
                Err(e)
            }
            Err(e) => {
                warn!("Refresh for {} rejected, evicting cached token: {}", scope, e);
                self.store.remove(key)?;
                Err(BrokerError::Unauthorized(format!(
                    "could not refresh the delegated token for {scope}: {e}"
                )))
            }
        }
    }

    fn latest_refresh_token(
        &self,
        principal: &Principal,
    ) -> Result<Option<SecureString>, BrokerError> {
        Ok(self
            .store
            .with_prefix(&principal_prefix(&principal.id))?
            .into_iter()
            .filter_map(|(_, token)| token.refresh_token.clone().map(|r| (token.expiry, r)))
            .max_by_key(|(expiry, _)| *expiry)
            .map(|(_, refresh_token)| refresh_token))
    }

    /// Get an application-only token for `scope` with the client-credentials grant.
    ///
    /// When `role` is given the token must carry that application permission.
    pub async fn get_app_only_access_token(
        &self,
        scope: &str,
        role: Option<&str>,
    ) -> Result<AccessToken, BrokerError> {
        validate_app_credentials(&self.config.oauth)?;

        if !scope.trim_end().ends_with("/.default") {
            return Err(BrokerError::Configuration(format!(
                "application-only tokens can only be requested for a '/.default' scope, not '{scope}'"
            )));
        }

        let key = application_key(&self.config.oauth.tenant, scope);
        let token = match self.cached(&key)? {
            Some(token) => {
                debug!("Application token cache hit for {}", scope);
                token
            }
            None => {
                let lock = self.key_lock(&key);
                let result = {
                    let _guard = lock.lock().await;
                    self.acquire_app_only(&key, scope).await
                };
                self.release_key_lock(&key, lock);
                result?
            }
        };

        if let Some(role) = role {
            let check = check_static_permission(Some(&token), role, PermissionKind::Application);
            if !check.passed {
                return Err(BrokerError::Forbidden(
                    check
                        .reason
                        .unwrap_or_else(|| format!("application permission '{role}' is missing")),
                ));
            }
        }

        Ok(token)
    }

    async fn acquire_app_only(&self, key: &str, scope: &str) -> Result<AccessToken, BrokerError> {
        if let Some(token) = self.cached(key)? {
            return Ok(token);
        }
        let response = self.oauth.client_credentials(scope).await?;
        let token = AccessToken::from_response(TokenKind::ApplicationOnly, scope, &response);
        self.store.put(key, &token)?;
        Ok(token)
    }

    /// Build the sign-in URL for the configured delegated scopes.
    pub fn sign_in_url(&self, pkce: &PkceChallenge) -> Result<(Url, String), BrokerError> {
        self.oauth.generate_auth_url(pkce, &self.config.oauth.scopes)
    }

    /// Redeem the authorization code of a completed sign-in and cache the token.
    ///
    /// The token is cached under the configured resource scope (the first scope
    /// that is not an OpenID Connect scope).
    pub async fn complete_sign_in(
        &self,
        ctx: &RequestContext,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<AccessToken, BrokerError> {
        let principal = ctx.principal.as_ref().ok_or_else(|| {
            BrokerError::BadRequest("sign-in must identify the principal".into())
        })?;

        let scope = self.config.oauth.scopes.join(" ");
        let response = self.oauth.exchange_code(code, pkce_verifier, &scope).await?;

        // The token must belong to the principal it is cached for.
        let oid = decode_claims(&response.access_token)
            .and_then(|claims| claims.get("oid").and_then(|v| v.as_str()).map(str::to_string));
        if let Some(oid) = oid {
            if !oid.eq_ignore_ascii_case(&principal.id) {
                warn!("Sign-in for {} returned a token of another user", principal.upn);
                return Err(BrokerError::Unauthorized(
                    "the signed-in account does not match the requesting user".into(),
                ));
            }
        }

        let cache_scope = self.resource_scope();
        let token = AccessToken::from_response(TokenKind::Delegated, &cache_scope, &response);
        self.store.put(&delegated_key(&principal.id, &cache_scope), &token)?;

        info!("Signed in {}", principal.upn);
        Ok(token)
    }

    /// The configured resource scope used to cache sign-in tokens.
    pub fn resource_scope(&self) -> String {
        const OIDC_SCOPES: [&str; 4] = ["openid", "profile", "email", "offline_access"];
        self.config
            .oauth
            .scopes
            .iter()
            .find(|s| !OIDC_SCOPES.contains(&s.to_ascii_lowercase().as_str()))
            .cloned()
            .unwrap_or_else(|| format!("https://graph.microsoft.{}/User.Read", self.config.graph.tld))
    }

    /// Evict every delegated token of `principal`.
    pub fn sign_out(&self, principal: &Principal) -> Result<usize, BrokerError> {
        let removed = self.store.remove_prefix(&principal_prefix(&principal.id))?;
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|k, _| !k.starts_with(&principal_prefix(&principal.id)));
        info!("Signed out {} ({} token(s) evicted)", principal.upn, removed);
        Ok(removed)
    }
}
