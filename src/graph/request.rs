//! Graph request and response types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// A request to Microsoft Graph or another allowlisted endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRequest {
    /// Absolute URL or path relative to the Graph host, e.g. `/me` or `/v1.0/users`.
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Return the raw response bytes base64 encoded instead of decoding JSON.
    #[serde(default)]
    pub binary: bool,
    /// Act on behalf of the signed-in user even if application access is permitted.
    #[serde(default = "default_true")]
    pub use_delegated: bool,
    /// Token scope; defaults to the Graph `/.default` scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_true() -> bool {
    true
}

impl GraphRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            binary: false,
            use_delegated: true,
            scope: None,
        }
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(endpoint)
        }
    }

    /// Prefer an application-only token when the endpoint permits it.
    pub fn application(mut self) -> Self {
        self.use_delegated = false;
        self
    }

    pub fn binary(mut self) -> Self {
        self.binary = true;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Count queries need `ConsistencyLevel: eventual`.
    pub fn is_count_query(&self) -> bool {
        self.endpoint.to_ascii_lowercase().contains("$count")
    }
}

/// Successful Graph response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphResponse {
    pub status_code: u16,
    /// Decoded JSON, or `{"binary": "<base64>"}` for binary requests.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders() {
        let request = GraphRequest::post("/users", json!({ "displayName": "x" }))
            .application()
            .with_header("Prefer", "return=minimal");
        assert_eq!(request.method, HttpMethod::Post);
        assert!(!request.use_delegated);
        assert_eq!(request.headers["Prefer"], "return=minimal");
    }

    #[test]
    fn test_count_query() {
        assert!(GraphRequest::get("/users/$count").is_count_query());
        assert!(GraphRequest::get("/users?$count=true").is_count_query());
        assert!(!GraphRequest::get("/users").is_count_query());
    }

    #[test]
    fn test_deserialize_defaults_to_delegated() {
        let request: GraphRequest =
            serde_json::from_value(json!({ "endpoint": "/me", "method": "GET" })).unwrap();
        assert!(request.use_delegated);
        assert!(!request.binary);
        assert!(request.headers.is_empty());
    }
}
