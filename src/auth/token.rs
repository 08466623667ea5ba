//! Access tokens and the grants they carry.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::oauth::TokenResponse;
use super::secure::SecureString;

/// Whether a token acts for a signed-in user or for the application itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Delegated,
    ApplicationOnly,
}

/// An OAuth2 access token as cached by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: SecureString,
    pub kind: TokenKind,
    /// Scope string the token was requested for.
    pub scope: String,
    /// Delegated scopes or application roles; `None` when they could not be parsed.
    grants: Option<BTreeSet<String>>,
    pub expiry: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SecureString>,
}

impl AccessToken {
    /// Build a token from an identity provider response.
    ///
    /// Grants are read from the JWT claims (`scp` for delegated, `roles` for
    /// application tokens). Delegated tokens fall back to the `scope` field of the
    /// response when the access token is opaque.
    pub fn from_response(kind: TokenKind, scope: &str, response: &TokenResponse) -> Self {
        let claims = decode_claims(&response.access_token);
        let grants = match kind {
            TokenKind::Delegated => claims
                .as_ref()
                .and_then(|c| c.get("scp"))
                .and_then(Value::as_str)
                .map(split_scopes)
                .or_else(|| {
                    (!response.scope.trim().is_empty()).then(|| split_scopes(&response.scope))
                }),
            TokenKind::ApplicationOnly => claims.as_ref().map(|c| {
                c.get("roles")
                    .and_then(Value::as_array)
                    .map(|roles| {
                        roles
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default()
            }),
        };

        let refresh_token = match kind {
            TokenKind::Delegated => response.refresh_token.clone().map(SecureString::from),
            TokenKind::ApplicationOnly => None,
        };

        Self {
            value: SecureString::from(response.access_token.clone()),
            kind,
            scope: scope.to_string(),
            grants,
            expiry: Utc::now() + Duration::seconds(response.expires_in as i64),
            refresh_token,
        }
    }

    /// Construct a token directly. Mostly useful for tests and imports.
    pub fn new(
        value: impl Into<SecureString>,
        kind: TokenKind,
        scope: impl Into<String>,
        grants: Option<Vec<String>>,
        expiry: DateTime<Utc>,
        refresh_token: Option<SecureString>,
    ) -> Self {
        Self {
            value: value.into(),
            kind,
            scope: scope.into(),
            grants: grants.map(|g| g.into_iter().collect()),
            expiry,
            refresh_token: match kind {
                TokenKind::Delegated => refresh_token,
                TokenKind::ApplicationOnly => None,
            },
        }
    }

    /// Delegated scopes; `None` for application tokens or when unparsed.
    pub fn scopes(&self) -> Option<&BTreeSet<String>> {
        match self.kind {
            TokenKind::Delegated => self.grants.as_ref(),
            TokenKind::ApplicationOnly => None,
        }
    }

    /// Application roles; `None` for delegated tokens or when unparsed.
    pub fn roles(&self) -> Option<&BTreeSet<String>> {
        match self.kind {
            TokenKind::ApplicationOnly => self.grants.as_ref(),
            TokenKind::Delegated => None,
        }
    }

    /// Returns true if the token is expired or expires within `skew`.
    pub fn is_expired(&self, skew: Duration) -> bool {
        Utc::now() + skew >= self.expiry
    }

    pub fn bearer(&self) -> &str {
        self.value.as_str()
    }
}

fn split_scopes(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Decode the payload of a JWT without verifying its signature.
///
/// The broker only reads its own tokens' grants; Graph verifies the signature.
pub fn decode_claims(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

/// Calculate the remaining time until token expiry.
pub fn time_until_expiry(expiry: DateTime<Utc>) -> Option<Duration> {
    let now = Utc::now();
    if expiry > now {
        Some(expiry - now)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) fn fake_jwt(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}
