//! Request context and capability registry.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A signed-in user on whose behalf delegated tokens are requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Azure AD object id.
    pub id: String,
    /// User principal name.
    pub upn: String,
}

/// State carried through one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Option<Principal>,
    pub correlation_id: Uuid,
}

impl RequestContext {
    /// Context for an anonymous request (application-only access at most).
    pub fn anonymous() -> Self {
        Self {
            principal: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Context for a request made by a signed-in principal.
    pub fn for_principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// Optional features that can be switched on in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Client-credentials tokens for endpoints that permit application access.
    AppOnlyAccess,
    /// Self-test may issue real Graph calls.
    LiveGraphChecks,
    /// The REST proxy route may forward arbitrary allowlisted endpoints.
    GraphProxy,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Self::AppOnlyAccess => "app_only",
            Self::LiveGraphChecks => "live_checks",
            Self::GraphProxy => "proxy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "app_only" => Some(Self::AppOnlyAccess),
            "live_checks" => Some(Self::LiveGraphChecks),
            "proxy" => Some(Self::GraphProxy),
            _ => None,
        }
    }
}

/// Set of enabled capabilities.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    enabled: HashSet<Capability>,
}

impl Capabilities {
    /// Build the registry from the `features.enabled` list. Unknown names are logged and ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut enabled = HashSet::new();
        for name in names {
            match Capability::from_name(name.as_ref()) {
                Some(capability) => {
                    enabled.insert(capability);
                }
                None => warn!("Ignoring unknown feature '{}'", name.as_ref()),
            }
        }
        Self { enabled }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.enabled.insert(capability);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_from_names() {
        let caps = Capabilities::from_names(&["app_only", "Live_Checks", "unknown"]);
        assert!(caps.has(Capability::AppOnlyAccess));
        assert!(caps.has(Capability::LiveGraphChecks));
        assert!(!caps.has(Capability::GraphProxy));
    }

    #[test]
    fn test_capability_names_roundtrip() {
        for cap in [
            Capability::AppOnlyAccess,
            Capability::LiveGraphChecks,
            Capability::GraphProxy,
        ] {
            assert_eq!(Capability::from_name(cap.name()), Some(cap));
        }
    }

    #[test]
    fn test_contexts_get_distinct_correlation_ids() {
        let a = RequestContext::anonymous();
        let b = RequestContext::anonymous();
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(a.principal.is_none());
    }
}
