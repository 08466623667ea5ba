//! Endpoint allowlist.
//!
//! Endpoints and allowlist entries are compared in a canonical form: lowercase,
//! absolute, with the API version segment replaced by `/_/`, so that
//! `/me`, `/v1.0/me` and `https://graph.microsoft.com/beta/me` all compare equal.

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::BrokerError;

/// Marker that replaces `/v1.0/` and `/beta/` in canonical endpoints.
pub const VERSION_WILDCARD: &str = "/_/";

/// Outcome of a successful endpoint validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAccess {
    /// Whether application-only tokens may be used for this endpoint.
    pub application_allowed: bool,
}

/// Canonical form of `endpoint` relative to `graph_host`.
pub fn canonicalize(graph_host: &str, endpoint: &str) -> String {
    let mut canonical = endpoint
        .trim()
        .to_ascii_lowercase()
        .replace("/v1.0/", VERSION_WILDCARD)
        .replace("/beta/", VERSION_WILDCARD);

    if !canonical.starts_with("https://") && !canonical.starts_with("http://") {
        if !canonical.starts_with('/') {
            canonical.insert(0, '/');
        }
        if !canonical.starts_with(VERSION_WILDCARD) {
            canonical.insert(0, '_');
            canonical.insert(0, '/');
        }
        canonical = format!(
            "{}{}",
            graph_host.trim_end_matches('/').to_ascii_lowercase(),
            canonical
        );
    }

    canonical
}

/// Prefix match that does not let `/me` match `/messages`.
fn matches_prefix(canonical: &str, prefix: &str) -> bool {
    match canonical.strip_prefix(prefix) {
        Some(rest) => {
            rest.is_empty()
                || prefix.ends_with('/')
                || rest.starts_with(['/', '?', '(', '$'])
        }
        None => false,
    }
}

/// True if a path segment is `.` or `..`, literally or percent-encoded.
///
/// URL parsers resolve these segments before the request is sent, which would
/// move an allowlisted path onto an arbitrary one.
fn has_dot_segment(endpoint: &str) -> bool {
    let path = match endpoint.find("://") {
        Some(i) => {
            let rest = &endpoint[i + 3..];
            rest.find(['/', '\\']).map_or("", |j| &rest[j..])
        }
        None => endpoint,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();

    path.split(['/', '\\']).any(|segment| {
        let decoded = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());
        // Tabs and newlines are dropped by URL parsers.
        let decoded: String = decoded.chars().filter(|c| !matches!(c, '\t' | '\n' | '\r')).collect();
        decoded == "." || decoded == ".."
    })
}

/// Administrator-configured endpoint policy.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    graph_host: String,
    allow_all: bool,
    entries: Vec<(String, bool)>,
}

impl EndpointPolicy {
    pub fn from_config(config: &Config) -> Self {
        let graph_host = config.graph_host();
        let entries = config
            .graph
            .allowed_endpoints
            .iter()
            .map(|e| (canonicalize(&graph_host, &e.prefix), e.application))
            .collect();

        if config.graph.allow_all_endpoints {
            warn!("All Graph endpoints are allowed; the endpoint allowlist is not enforced");
        }

        Self {
            graph_host,
            allow_all: config.graph.allow_all_endpoints,
            entries,
        }
    }

    pub fn canonicalize(&self, endpoint: &str) -> String {
        canonicalize(&self.graph_host, endpoint)
    }

    /// Check `endpoint` against the allowlist.
    pub fn validate_endpoint(&self, endpoint: &str) -> Result<EndpointAccess, BrokerError> {
        if endpoint.trim().is_empty() {
            return Err(BrokerError::BadRequest("endpoint must not be empty".into()));
        }

        if has_dot_segment(endpoint) {
            warn!("Rejected endpoint {} with dot segments", endpoint);
            return Err(BrokerError::BadRequest(format!(
                "endpoint '{endpoint}' must not contain '.' or '..' path segments"
            )));
        }

        if self.allow_all {
            return Ok(EndpointAccess {
                application_allowed: true,
            });
        }

        let canonical = self.canonicalize(endpoint);
        let matched = self
            .entries
            .iter()
            .filter(|(prefix, _)| matches_prefix(&canonical, prefix))
            .max_by_key(|(prefix, _)| prefix.len());

        match matched {
            Some((prefix, application)) => {
                debug!("Endpoint {} allowed by {}", canonical, prefix);
                Ok(EndpointAccess {
                    application_allowed: *application,
                })
            }
            None => {
                warn!("Endpoint {} is not in the allowlist", canonical);
                Err(BrokerError::Forbidden(format!(
                    "endpoint '{endpoint}' is not in the list of allowed Graph endpoints"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, AllowedEndpoint};

    const HOST: &str = "https://graph.microsoft.com";

    #[test]
    fn test_canonicalize_forms_agree() {
        let expected = "https://graph.microsoft.com/_/me";
        assert_eq!(canonicalize(HOST, "/me"), expected);
        assert_eq!(canonicalize(HOST, "me"), expected);
        assert_eq!(canonicalize(HOST, "/v1.0/me"), expected);
        assert_eq!(canonicalize(HOST, "https://graph.microsoft.com/beta/me"), expected);
        assert_eq!(canonicalize(HOST, "HTTPS://Graph.Microsoft.com/v1.0/Me"), expected);
    }

    #[test]
    fn test_prefix_respects_segments() {
        assert!(matches_prefix("https://h/_/me", "https://h/_/me"));
        assert!(matches_prefix("https://h/_/me/drive", "https://h/_/me"));
        assert!(matches_prefix("https://h/_/users?$top=5", "https://h/_/users"));
        assert!(!matches_prefix("https://h/_/messages", "https://h/_/me"));
    }

    #[test]
    fn test_allowlist() {
        let policy = EndpointPolicy::from_config(&test_config());

        let me = policy.validate_endpoint("/v1.0/me/memberOf").unwrap();
        assert!(!me.application_allowed);

        let users = policy.validate_endpoint("https://graph.microsoft.com/beta/users/abc").unwrap();
        assert!(users.application_allowed);

        assert!(matches!(
            policy.validate_endpoint("/security/alerts"),
            Err(BrokerError::Forbidden(_))
        ));
        assert!(matches!(policy.validate_endpoint(" "), Err(BrokerError::BadRequest(_))));
    }

    #[test]
    fn test_dot_segments_are_rejected() {
        let policy = EndpointPolicy::from_config(&test_config());
        for endpoint in [
            "/me/../security/alerts",
            "/me/%2e%2e/security/alerts",
            "/me/%2E./security/alerts",
            "/me/..\\security/alerts",
            "/me/./../security/alerts",
            "/users/..",
            "https://graph.microsoft.com/v1.0/me/../security/alerts",
        ] {
            assert!(
                matches!(policy.validate_endpoint(endpoint), Err(BrokerError::BadRequest(_))),
                "accepted {endpoint}"
            );
        }

        // Dots inside a segment and in the query are fine.
        assert!(policy.validate_endpoint("/users/adele.vance%40contoso.com").is_ok());
        assert!(policy.validate_endpoint("/users?$filter=startswith(mail,'a..b')").is_ok());
    }

    #[test]
    fn test_allow_all_toggles_same_input() {
        let mut config = test_config();
        let endpoint = "https://contoso.sharepoint.com/_api/web";

        let policy = EndpointPolicy::from_config(&config);
        assert!(matches!(policy.validate_endpoint(endpoint), Err(BrokerError::Forbidden(_))));

        config.graph.allow_all_endpoints = true;
        let policy = EndpointPolicy::from_config(&config);
        assert!(policy.validate_endpoint(endpoint).unwrap().application_allowed);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut config = test_config();
        config.graph.allowed_endpoints = vec![
            AllowedEndpoint {
                prefix: "/users".into(),
                application: false,
            },
            AllowedEndpoint {
                prefix: "/v1.0/users/delta".into(),
                application: true,
            },
        ];
        let policy = EndpointPolicy::from_config(&config);
        assert!(policy.validate_endpoint("/users/delta").unwrap().application_allowed);
        assert!(!policy.validate_endpoint("/users/abc").unwrap().application_allowed);
    }
}
