//! Typed REST boundary.
//!
//! Each route delegates to the Graph client or the token broker. Failures
//! become `{"code": ..., "message": ...}` bodies with the status code of the
//! underlying [`BrokerError`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::TokenBroker;
use crate::context::{Capabilities, Capability, RequestContext};
use crate::error::BrokerError;
use crate::graph::{GraphClient, GraphRequest};

#[derive(Debug, Clone)]
pub enum Route {
    /// A single user by object id or user principal name.
    User(String),
    Users,
    MyOrganization,
    Me,
    Groups,
    Drives,
    Sites,
    /// Arbitrary allowlisted Graph request. Requires [`Capability::GraphProxy`].
    Proxy(GraphRequest),
    /// Hand a delegated access token to the caller.
    Token { scope: Option<String> },
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Users => "users",
            Self::MyOrganization => "myorganization",
            Self::Me => "me",
            Self::Groups => "groups",
            Self::Drives => "drives",
            Self::Sites => "sites",
            Self::Proxy(_) => "proxy",
            Self::Token { .. } => "token",
        }
    }

    /// Graph request behind a fixed route.
    fn graph_request(&self) -> Result<GraphRequest, BrokerError> {
        let endpoint = match self {
            Self::User(id) => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(BrokerError::BadRequest("user id is required".into()));
                }
                format!("/users/{}", urlencoding::encode(id))
            }
            Self::Users => "/users".to_string(),
            Self::MyOrganization => "/organization".to_string(),
            Self::Me => "/me".to_string(),
            Self::Groups => "/groups".to_string(),
            Self::Drives => "/drives".to_string(),
            Self::Sites => "/sites/root".to_string(),
            Self::Proxy(request) => return Ok(request.clone()),
            Self::Token { .. } => {
                return Err(BrokerError::BadRequest("token route has no Graph request".into()))
            }
        };
        Ok(GraphRequest::get(endpoint))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(err: &BrokerError) -> Self {
        Self {
            status: err.status_code(),
            body: json!({
                "code": err.code(),
                "message": err.user_message(),
                "details": err.to_string(),
            }),
        }
    }
}

pub struct RestService {
    graph: Arc<GraphClient>,
    broker: Arc<TokenBroker>,
    capabilities: Capabilities,
}

impl RestService {
    pub fn new(graph: Arc<GraphClient>, broker: Arc<TokenBroker>, capabilities: Capabilities) -> Self {
        Self {
            graph,
            broker,
            capabilities,
        }
    }

    pub async fn dispatch(&self, ctx: &RequestContext, route: Route) -> RestResponse {
        debug!("REST {} (correlation {})", route.name(), ctx.correlation_id);
        match self.handle(ctx, &route).await {
            Ok(body) => RestResponse::ok(body),
            Err(e) => {
                warn!(
                    "REST {} failed with {} (correlation {}): {}",
                    route.name(),
                    e.code(),
                    ctx.correlation_id,
                    e
                );
                RestResponse::error(&e)
            }
        }
    }

    async fn handle(&self, ctx: &RequestContext, route: &Route) -> Result<Value, BrokerError> {
        match route {
            Route::Token { scope } => {
                let scope = scope
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| self.broker.resource_scope());
                let token = self.broker.get_access_token(ctx, &scope).await?;
                Ok(json!({
                    "access_token": token.bearer(),
                    "token_type": "Bearer",
                    "expires_on": token.expiry.timestamp(),
                    "scope": scope,
                }))
            }
            Route::Proxy(_) if !self.capabilities.has(Capability::GraphProxy) => Err(
                BrokerError::Forbidden("the Graph proxy is not enabled".into()),
            ),
            _ => {
                let request = route.graph_request()?;
                let response = self.graph.fetch(ctx, &request).await?;
                Ok(response.payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::delegated_key;
    use crate::auth::{AccessToken, MemoryTokenStore, TokenKind, TokenStore};
    use crate::config::{test_config, Config};
    use crate::context::Principal;
    use chrono::{Duration, Utc};
    use httpmock::prelude::*;

    fn principal() -> Principal {
        Principal {
            id: "user-1".into(),
            upn: "adele@contoso.com".into(),
        }
    }

    fn service(config: Config, capabilities: Capabilities) -> RestService {
        let config = Arc::new(config);
        let store = Arc::new(MemoryTokenStore::new());
        let scope = config.graph_default_scope();
        store
            .put(
                &delegated_key(&principal().id, &scope),
                &AccessToken::new(
                    "delegated-token",
                    TokenKind::Delegated,
                    &scope,
                    None,
                    Utc::now() + Duration::hours(1),
                    None,
                ),
            )
            .unwrap();
        let broker = Arc::new(TokenBroker::new(Arc::clone(&config), store).unwrap());
        let graph = Arc::new(
            GraphClient::new(config, Arc::clone(&broker), capabilities.clone()).unwrap(),
        );
        RestService::new(graph, broker, capabilities)
    }

    #[test]
    fn test_user_id_is_encoded() {
        let request = Route::User("adele vance@contoso.com".into()).graph_request().unwrap();
        assert_eq!(request.endpoint, "/users/adele%20vance%40contoso.com");

        let err = Route::User("  ".into()).graph_request().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_error_body() {
        let response = RestResponse::error(&BrokerError::Unauthorized("no token".into()));
        assert_eq!(response.status, 401);
        assert_eq!(response.body["code"], BrokerError::Unauthorized(String::new()).code());
        assert!(response.body["message"].as_str().unwrap().contains("sign in"));
    }

    #[tokio::test]
    async fn me_route_returns_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1.0/me")
                    .header("authorization", "Bearer delegated-token");
                then.status(200).json_body(json!({ "displayName": "Adele Vance" }));
            })
            .await;

        let mut config = test_config();
        config.graph.host = Some(server.base_url());
        config.oauth.authority_host = server.base_url();
        let rest = service(config, Capabilities::default());

        let ctx = RequestContext::for_principal(principal());
        let response = rest.dispatch(&ctx, Route::Me).await;
        assert_eq!(response, RestResponse::ok(json!({ "displayName": "Adele Vance" })));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn anonymous_caller_is_unauthorized() {
        let rest = service(test_config(), Capabilities::default());
        let response = rest.dispatch(&RequestContext::anonymous(), Route::Me).await;
        assert_eq!(response.status, 401);

        let response = rest
            .dispatch(&RequestContext::anonymous(), Route::Token { scope: None })
            .await;
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn user_route_cannot_climb_out_of_users() {
        let rest = service(test_config(), Capabilities::default());
        let ctx = RequestContext::for_principal(principal());
        for id in ["..", "."] {
            let response = rest.dispatch(&ctx, Route::User(id.into())).await;
            assert_eq!(response.status, 400, "user id {id}");
        }
    }

    #[tokio::test]
    async fn proxy_requires_capability() {
        let rest = service(test_config(), Capabilities::default());
        let ctx = RequestContext::for_principal(principal());
        let response = rest.dispatch(&ctx, Route::Proxy(GraphRequest::get("/me"))).await;
        assert_eq!(response.status, 403);
    }

    #[tokio::test]
    async fn proxy_rejects_endpoint_outside_allowlist() {
        let rest = service(test_config(), Capabilities::default().with(Capability::GraphProxy));
        let ctx = RequestContext::for_principal(principal());
        let response = rest
            .dispatch(&ctx, Route::Proxy(GraphRequest::get("/applications")))
            .await;
        assert_eq!(response.status, 403);
        assert_eq!(response.body["code"], BrokerError::Forbidden(String::new()).code());
    }

    #[tokio::test]
    async fn token_route_returns_cached_token() {
        let config = test_config();
        let scope = config.graph_default_scope();
        let rest = service(config, Capabilities::default());
        let ctx = RequestContext::for_principal(principal());

        let response = rest
            .dispatch(&ctx, Route::Token { scope: Some(scope) })
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["access_token"], "delegated-token");
        assert_eq!(response.body["token_type"], "Bearer");
    }
}
