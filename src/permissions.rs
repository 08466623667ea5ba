//! Static permission checks against the grants of an access token.
//!
//! A check never contacts the identity provider. Permission names compare
//! case-insensitively, and the Graph resource prefix
//! (`https://graph.microsoft.<tld>/`) is ignored on both sides.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::auth::token::{AccessToken, TokenKind};

/// Reason reported when the token or its grants are not available.
pub const TOKEN_UNAVAILABLE: &str = "skipped, token unavailable";

static GRAPH_RESOURCE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^https?://graph\.microsoft\.[a-z]+(\.[a-z]+)*/+").expect("static prefix pattern")
});

/// Permissions that were superseded by narrower ones. Requested first, granted alternative second.
const LEGACY_ALTERNATIVES: &[(&str, &str)] = &[
    ("Group.Read.All", "GroupMember.Read.All"),
    ("User.Read.All", "User.ReadBasic.All"),
];

/// Which grant list a permission lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Delegated,
    Application,
}

impl PermissionKind {
    fn token_kind(self) -> TokenKind {
        match self {
            Self::Delegated => TokenKind::Delegated,
            Self::Application => TokenKind::ApplicationOnly,
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delegated => f.write_str("Delegated"),
            Self::Application => f.write_str("Application"),
        }
    }
}

/// Outcome of a single permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheckResult {
    /// Normalized permission (lowercase, without resource prefix).
    pub requested_permission: String,
    pub permission_kind: PermissionKind,
    pub passed: bool,
    /// Remediation text when the check failed.
    pub reason: Option<String>,
    /// False when the token or its grants could not be obtained.
    pub token_available: bool,
    /// Granted replacement for a legacy permission, if any.
    pub alternative: Option<String>,
}

/// Strip the Graph resource prefix, keeping the original casing.
pub fn short_permission_name(permission: &str) -> &str {
    let trimmed = permission.trim();
    match GRAPH_RESOURCE_PREFIX.find(trimmed) {
        Some(m) => &trimmed[m.end()..],
        None => trimmed,
    }
}

/// Lowercase and strip the Graph resource prefix.
pub fn normalize_permission(permission: &str) -> String {
    short_permission_name(permission).to_ascii_lowercase()
}

fn normalized_grants(grants: &BTreeSet<String>) -> BTreeSet<String> {
    grants.iter().map(|g| normalize_permission(g)).collect()
}

/// Check whether `token` already carries `permission`.
///
/// `token` is `None` when it could not be obtained; the result then reports
/// [`TOKEN_UNAVAILABLE`] rather than a missing grant.
pub fn check_static_permission(
    token: Option<&AccessToken>,
    permission: &str,
    kind: PermissionKind,
) -> PermissionCheckResult {
    let display = short_permission_name(permission);
    let requested = normalize_permission(permission);

    let mut result = PermissionCheckResult {
        requested_permission: requested.clone(),
        permission_kind: kind,
        passed: false,
        reason: None,
        token_available: true,
        alternative: None,
    };

    let Some(token) = token else {
        result.token_available = false;
        result.reason = Some(TOKEN_UNAVAILABLE.to_string());
        return result;
    };

    if token.kind != kind.token_kind() {
        result.reason = Some(format!(
            "The {kind} permission '{display}' cannot be verified with a {} token. \
             Request a {} token to check it.",
            describe(token.kind),
            describe(kind.token_kind()),
        ));
        return result;
    }

    let grants = match kind {
        PermissionKind::Delegated => token.scopes(),
        PermissionKind::Application => token.roles(),
    };
    let Some(grants) = grants else {
        result.token_available = false;
        result.reason = Some(TOKEN_UNAVAILABLE.to_string());
        return result;
    };

    let granted = normalized_grants(grants);
    if granted.contains(&requested) {
        result.passed = true;
        return result;
    }

    let alternative = LEGACY_ALTERNATIVES
        .iter()
        .find(|(legacy, _)| legacy.eq_ignore_ascii_case(&requested))
        .map(|(_, replacement)| *replacement)
        .filter(|replacement| granted.contains(&replacement.to_ascii_lowercase()));

    result.reason = Some(match alternative {
        Some(replacement) => {
            result.alternative = Some(replacement.to_string());
            format!(
                "The {kind} permission '{display}' has not been granted, but '{replacement}' has. \
                 Switch to '{replacement}' (it grants everything needed with fewer privileges) by \
                 requiring it instead of '{display}'. Alternatively add '{display}' under App \
                 registrations > API permissions > Add a permission > Microsoft Graph > {kind} \
                 permissions and grant admin consent."
            )
        }
        None => format!(
            "The {kind} permission '{display}' has not been granted. In Azure AD open App \
             registrations > API permissions, click Add a permission > Microsoft Graph > {kind} \
             permissions, add '{display}' and grant admin consent."
        ),
    });
    result
}

fn describe(kind: TokenKind) -> &'static str {
    match kind {
        TokenKind::Delegated => "delegated",
        TokenKind::ApplicationOnly => "application-only",
    }
}
