//! Microsoft Graph request executor.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::endpoint::{EndpointAccess, EndpointPolicy};
use super::request::{GraphRequest, GraphResponse, HttpMethod};
use crate::auth::{AccessToken, TokenBroker};
use crate::config::Config;
use crate::context::{Capabilities, Capability, RequestContext};
use crate::error::BrokerError;

/// Executes allowlisted, authenticated requests against Microsoft Graph.
pub struct GraphClient {
    config: Arc<Config>,
    broker: Arc<TokenBroker>,
    policy: EndpointPolicy,
    capabilities: Capabilities,
    http_client: reqwest::Client,
}

impl GraphClient {
    /// Create a new Graph client.
    pub fn new(
        config: Arc<Config>,
        broker: Arc<TokenBroker>,
        capabilities: Capabilities,
    ) -> Result<Self, BrokerError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.http.connect_timeout_seconds))
            .danger_accept_invalid_certs(config.graph.skip_tls_verify)
            .build()
            .map_err(BrokerError::Network)?;

        Ok(Self {
            policy: EndpointPolicy::from_config(&config),
            config,
            broker,
            capabilities,
            http_client,
        })
    }

    pub fn validate_endpoint(&self, endpoint: &str) -> Result<EndpointAccess, BrokerError> {
        self.policy.validate_endpoint(endpoint)
    }

    /// Absolute URL for `endpoint`; relative paths get the Graph host and version.
    pub fn resolve_url(&self, endpoint: &str) -> String {
        let endpoint = endpoint.trim();
        if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            return endpoint.to_string();
        }

        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{endpoint}")
        };
        let lower = path.to_ascii_lowercase();
        if lower.starts_with("/v1.0/") || lower.starts_with("/beta/") {
            format!("{}{}", self.config.graph_host(), path)
        } else {
            format!("{}/{}{}", self.config.graph_host(), self.config.graph.version, path)
        }
    }

    async fn acquire_token(
        &self,
        ctx: &RequestContext,
        request: &GraphRequest,
        access: EndpointAccess,
    ) -> Result<AccessToken, BrokerError> {
        let scope = request
            .scope
            .clone()
            .unwrap_or_else(|| self.config.graph_default_scope());

        // Named scopes need user consent; only `/.default` works for client credentials.
        let use_application = !request.use_delegated
            && access.application_allowed
            && scope.ends_with("/.default")
            && self.capabilities.has(Capability::AppOnlyAccess);

        if use_application {
            debug!("Using application-only token for {}", request.endpoint);
            self.broker.get_app_only_access_token(&scope, None).await
        } else {
            debug!("Using delegated token for {}", request.endpoint);
            self.broker.get_access_token(ctx, &scope).await
        }
    }

    fn headers(&self, request: &GraphRequest) -> Result<HeaderMap, BrokerError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| BrokerError::BadRequest(format!("invalid header name '{name}'")))?;
            if name == AUTHORIZATION {
                return Err(BrokerError::BadRequest(
                    "the Authorization header is set by the broker".into(),
                ));
            }
            let value = HeaderValue::from_str(value)
                .map_err(|_| BrokerError::BadRequest(format!("invalid value for header '{name}'")))?;
            headers.insert(name, value);
        }

        if request.is_count_query() && !headers.contains_key("consistencylevel") {
            headers.insert("consistencylevel", HeaderValue::from_static("eventual"));
        }
        Ok(headers)
    }

    /// Validate, authenticate, dispatch and interpret one request.
    pub async fn fetch(
        &self,
        ctx: &RequestContext,
        request: &GraphRequest,
    ) -> Result<GraphResponse, BrokerError> {
        let access = self.validate_endpoint(&request.endpoint)?;
        let headers = self.headers(request)?;
        let token = self.acquire_token(ctx, request, access).await?;
        let url = self.resolve_url(&request.endpoint);

        debug!(
            "Graph {:?} {} (correlation {})",
            request.method, url, ctx.correlation_id
        );

        let builder = match request.method {
            HttpMethod::Get => self.http_client.get(&url),
            HttpMethod::Post => self.http_client.post(&url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder
            .headers(headers)
            .bearer_auth(token.bearer())
            .send()
            .await
            .map_err(|e| BrokerError::from_transport(&url, e))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BrokerError::from_transport(&url, e))?;

        interpret_response(&request.endpoint, status, &bytes, request.binary)
    }
}

/// Map a raw HTTP response to a [`GraphResponse`] or a typed error.
pub fn interpret_response(
    endpoint: &str,
    status: u16,
    body: &[u8],
    binary: bool,
) -> Result<GraphResponse, BrokerError> {
    if !(200..=299).contains(&status) {
        let body = String::from_utf8_lossy(body).into_owned();
        error!("Graph request to {} failed: HTTP {} - {}", endpoint, status, body);
        return Err(BrokerError::GraphFetch {
            status,
            body,
            endpoint: endpoint.to_string(),
        });
    }

    let payload = if binary {
        json!({ "binary": STANDARD.encode(body) })
    } else if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body).map_err(|e| BrokerError::Conversion {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?
    };

    info!("Graph request to {} succeeded: HTTP {}", endpoint, status);
    Ok(GraphResponse {
        status_code: status,
        payload,
    })
}
