//! The individual self-test checks.

use serde_json::json;

use super::{Category, Fix, Severity, TestResult};
use crate::auth::credentials::{
    validate_application_id, validate_application_secret, validate_tenant,
};
use crate::auth::{AccessToken, TokenBroker};
use crate::config::Config;
use crate::context::{Capabilities, Capability, RequestContext};
use crate::error::BrokerError;
use crate::graph::{GraphClient, GraphRequest};
use crate::permissions::{check_static_permission, PermissionKind};

const REGISTER_APP_DOCS: &str =
    "https://learn.microsoft.com/en-us/entra/identity-platform/quickstart-register-app";
const PERMISSIONS_DOCS: &str = "https://learn.microsoft.com/en-us/graph/permissions-reference";

/// Collaborators available to every check.
pub struct CheckEnv<'a> {
    pub config: &'a Config,
    pub broker: &'a TokenBroker,
    pub graph: &'a GraphClient,
    pub capabilities: &'a Capabilities,
    pub ctx: &'a RequestContext,
}

#[derive(Debug, Default)]
pub enum TokenState {
    /// The token check did not apply.
    #[default]
    NotAttempted,
    Unavailable,
    Acquired(AccessToken),
}

impl TokenState {
    fn token(&self) -> Option<&AccessToken> {
        match self {
            Self::Acquired(token) => Some(token),
            _ => None,
        }
    }
}

/// State shared by the checks of one run.
#[derive(Debug, Default)]
pub struct RunState {
    pub delegated: TokenState,
    pub application: TokenState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    TenantId,
    ApplicationId,
    ApplicationSecret,
    EndpointPolicy,
    TlsVerification,
    DelegatedToken,
    DelegatedPermission(String),
    ApplicationToken,
    ApplicationPermission(String),
    LiveGraph,
}

/// Checks in execution order.
pub fn plan(config: &Config) -> Vec<Check> {
    let mut checks = vec![
        Check::TenantId,
        Check::ApplicationId,
        Check::ApplicationSecret,
        Check::EndpointPolicy,
        Check::TlsVerification,
        Check::DelegatedToken,
    ];
    checks.extend(
        config
            .diagnostics
            .delegated_permissions
            .iter()
            .cloned()
            .map(Check::DelegatedPermission),
    );
    checks.push(Check::ApplicationToken);
    checks.extend(
        config
            .diagnostics
            .application_permissions
            .iter()
            .cloned()
            .map(Check::ApplicationPermission),
    );
    checks.push(Check::LiveGraph);
    checks
}

fn configuration_check(
    title: &str,
    severity: Severity,
    outcome: Result<(), BrokerError>,
    ok: &str,
) -> TestResult {
    let result = TestResult::new(title, Category::Configuration, severity).more_info(REGISTER_APP_DOCS);
    match outcome {
        Ok(()) => result.pass(ok),
        Err(BrokerError::Configuration(message)) => result.fail(message),
        Err(other) => result.fail(other.to_string()),
    }
}

impl Check {
    pub async fn run(&self, env: &CheckEnv<'_>, state: &mut RunState) -> Option<TestResult> {
        match self {
            Self::TenantId => Some(configuration_check(
                "Directory (tenant) ID",
                Severity::Blocking,
                validate_tenant(&env.config.oauth.tenant),
                "Directory (tenant) ID is configured.",
            )),
            Self::ApplicationId => Some(configuration_check(
                "Application (client) ID",
                Severity::Blocking,
                validate_application_id(&env.config.oauth.application_id),
                "Application (client) ID is a valid GUID.",
            )),
            Self::ApplicationSecret => Some(configuration_check(
                "Application secret",
                Severity::Critical,
                validate_application_secret(&env.config.oauth.application_secret),
                "Application secret is configured.",
            )),
            Self::EndpointPolicy => Some(endpoint_policy(env.config)),
            Self::TlsVerification => Some(tls_verification(env.config)),
            Self::DelegatedToken => {
                let principal = env.ctx.principal.as_ref()?;
                let scope = env.broker.resource_scope();
                let result = TestResult::new(
                    "Delegated access token",
                    Category::AccessToken,
                    Severity::Critical,
                );
                Some(match env.broker.get_access_token(env.ctx, &scope).await {
                    Ok(token) => {
                        let data = json!({
                            "scope": scope,
                            "expiry": token.expiry.to_rfc3339(),
                            "scopes": token.scopes(),
                        });
                        state.delegated = TokenState::Acquired(token);
                        result
                            .pass(format!("Acquired a delegated token for {}.", principal.upn))
                            .data(data)
                    }
                    Err(e) => {
                        state.delegated = TokenState::Unavailable;
                        result.fail(format!(
                            "Could not acquire a delegated token for {}: {e}. {}",
                            principal.upn,
                            e.user_message()
                        ))
                    }
                })
            }
            Self::DelegatedPermission(permission) => {
                if matches!(state.delegated, TokenState::NotAttempted) {
                    return None;
                }
                Some(permission_check(
                    state.delegated.token(),
                    permission,
                    PermissionKind::Delegated,
                    "diagnostics.delegated_permissions",
                ))
            }
            Self::ApplicationToken => {
                if !env.capabilities.has(Capability::AppOnlyAccess) {
                    return None;
                }
                let scope = env.config.graph_default_scope();
                let result = TestResult::new(
                    "Application-only access token",
                    Category::AccessToken,
                    Severity::Critical,
                );
                Some(match env.broker.get_app_only_access_token(&scope, None).await {
                    Ok(token) => {
                        let data = json!({
                            "scope": scope,
                            "expiry": token.expiry.to_rfc3339(),
                            "roles": token.roles(),
                        });
                        state.application = TokenState::Acquired(token);
                        result
                            .pass("Acquired an application-only token with the client credentials.")
                            .data(data)
                    }
                    Err(e) => {
                        state.application = TokenState::Unavailable;
                        result
                            .fail(format!("Could not acquire an application-only token: {e}"))
                            .more_info(REGISTER_APP_DOCS)
                    }
                })
            }
            Self::ApplicationPermission(permission) => {
                if matches!(state.application, TokenState::NotAttempted) {
                    return None;
                }
                Some(permission_check(
                    state.application.token(),
                    permission,
                    PermissionKind::Application,
                    "diagnostics.application_permissions",
                ))
            }
            Self::LiveGraph => live_graph(env, state).await,
        }
    }
}

fn endpoint_policy(config: &Config) -> TestResult {
    let result = TestResult::new("Graph endpoint allowlist", Category::Configuration, Severity::Low);

    if config.graph.allow_all_endpoints {
        return result
            .fail(
                "All Graph endpoints are allowed. Any caller of the proxy can reach any API the \
                 app registration has been granted. Restrict access to the endpoints you need.",
            )
            .fix(Fix::set("graph.allow_all_endpoints", json!(false)));
    }

    if config.graph.allowed_endpoints.is_empty() {
        return TestResult::new("Graph endpoint allowlist", Category::Configuration, Severity::Critical)
            .fail("No Graph endpoints are allowed, so every Graph request will be rejected.")
            .fix(Fix::add(
                "graph.allowed_endpoints",
                json!({ "prefix": "/me", "application": false }),
            ));
    }

    result
        .pass(format!(
            "{} Graph endpoint prefix(es) are allowed.",
            config.graph.allowed_endpoints.len()
        ))
        .data(json!(config.graph.allowed_endpoints))
}

fn tls_verification(config: &Config) -> TestResult {
    let result = TestResult::new("TLS certificate verification", Category::Configuration, Severity::Critical);
    if config.graph.skip_tls_verify {
        result
            .fail("TLS certificate verification for Graph requests is switched off.")
            .fix(Fix::set("graph.skip_tls_verify", json!(false)))
    } else {
        result.pass("TLS certificates of Graph responses are verified.")
    }
}

fn permission_check(
    token: Option<&AccessToken>,
    permission: &str,
    kind: PermissionKind,
    option: &str,
) -> TestResult {
    let check = check_static_permission(token, permission, kind);
    let result = TestResult::new(
        format!("{kind} permission {permission}"),
        Category::Permissions,
        Severity::Critical,
    )
    .more_info(PERMISSIONS_DOCS)
    .data(json!({
        "permission": check.requested_permission,
        "kind": kind,
        "token_available": check.token_available,
    }));

    if check.passed {
        return result.pass(format!("The {kind} permission '{permission}' has been granted."));
    }

    let result = result.fail(check.reason.unwrap_or_default());
    match check.alternative {
        Some(alternative) => result.fix(Fix::replace(option, json!(permission), json!(alternative))),
        None => result,
    }
}

async fn live_graph(env: &CheckEnv<'_>, state: &RunState) -> Option<TestResult> {
    if !env.capabilities.has(Capability::LiveGraphChecks) {
        return None;
    }

    let (title, request) = if state.delegated.token().is_some() {
        ("Graph request on behalf of the user", GraphRequest::get("/me"))
    } else if state.application.token().is_some() {
        ("Graph request as the application", GraphRequest::get("/organization").application())
    } else {
        return None;
    };

    let result = TestResult::new(title, Category::Graph, Severity::Critical);
    Some(match env.graph.fetch(env.ctx, &request).await {
        Ok(response) => result
            .pass(format!(
                "GET {} returned HTTP {}.",
                request.endpoint, response.status_code
            ))
            .data(json!({ "status": response.status_code })),
        Err(BrokerError::GraphFetch { status, body, .. }) => result
            .fail(format!(
                "GET {} returned HTTP {status}. Check the permissions granted to the app registration.",
                request.endpoint
            ))
            .more_info(PERMISSIONS_DOCS)
            .data(json!({ "status": status, "body": body })),
        Err(BrokerError::Forbidden(message)) => result
            .fail(format!("{message}. Allow the endpoint to run this check."))
            .fix(Fix::add(
                "graph.allowed_endpoints",
                json!({
                    "prefix": request.endpoint,
                    "application": !request.use_delegated,
                }),
            )),
        Err(e) => result.fail(format!("GET {} failed: {e}", request.endpoint)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::fake_jwt;
    use crate::auth::MemoryTokenStore;
    use crate::config::test_config;
    use crate::diagnostics::{DiagnosticRunner, FixOperation};
    use httpmock::prelude::*;
    use std::sync::Arc;

    const TOKEN_PATH: &str = "/contoso.onmicrosoft.com/oauth2/v2.0/token";

    fn runner(config: Config) -> DiagnosticRunner {
        let config = Arc::new(config);
        let capabilities = Capabilities::from_names(&config.features.enabled);
        let broker = Arc::new(
            TokenBroker::new(Arc::clone(&config), Arc::new(MemoryTokenStore::new())).unwrap(),
        );
        let graph = Arc::new(
            GraphClient::new(Arc::clone(&config), Arc::clone(&broker), capabilities.clone()).unwrap(),
        );
        DiagnosticRunner::new(config, broker, graph, capabilities)
    }

    fn find<'a>(results: &'a [TestResult], title: &str) -> &'a TestResult {
        results
            .iter()
            .find(|r| r.title == title)
            .unwrap_or_else(|| panic!("no result titled {title}"))
    }

    #[test]
    fn test_plan_order() {
        let config = test_config();
        let plan = plan(&config);
        assert_eq!(plan[0], Check::TenantId);
        assert_eq!(plan.last(), Some(&Check::LiveGraph));
        let token_at = plan.iter().position(|c| *c == Check::ApplicationToken).unwrap();
        let permission_at = plan
            .iter()
            .position(|c| matches!(c, Check::ApplicationPermission(_)))
            .unwrap();
        assert!(token_at < permission_at);
    }

    #[test]
    fn test_allow_all_suggests_fix() {
        let mut config = test_config();
        config.graph.allow_all_endpoints = true;
        let result = endpoint_policy(&config);
        assert!(!result.passed);
        let fix = result.fix.unwrap();
        assert_eq!(fix.operation, FixOperation::Set);
        assert_eq!(fix.option, "graph.allow_all_endpoints");
        assert_eq!(fix.value, json!(false));
    }

    #[tokio::test]
    async fn misconfigured_app_reports_without_network() {
        let mut config = test_config();
        config.oauth.application_id = "not-a-guid".into();
        config.features.enabled.clear();
        let results = runner(config).run(&RequestContext::anonymous(), true).await;

        assert!(!find(&results, "Application (client) ID").passed);
        assert!(find(&results, "Directory (tenant) ID").passed);
        // No principal and no app-only feature: token and permission checks do not apply.
        assert!(results.iter().all(|r| r.category == Category::Configuration));
    }

    #[tokio::test]
    async fn application_run_checks_roles_and_caches() {
        let server = MockServer::start_async().await;
        let token_mock = server
            .mock_async(|when, then| {
                when.method(POST).path(TOKEN_PATH);
                then.status(200).json_body(json!({
                    "access_token": fake_jwt(json!({ "roles": ["GroupMember.Read.All"] })),
                    "expires_in": 3600
                }));
            })
            .await;
        let graph_mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1.0/organization");
                then.status(200).json_body(json!({ "value": [{ "id": "tenant" }] }));
            })
            .await;

        let mut config = test_config();
        config.oauth.authority_host = server.base_url();
        config.graph.host = Some(server.base_url());
        config.diagnostics.application_permissions = vec!["Group.Read.All".into()];
        let runner = runner(config);

        let ctx = RequestContext::anonymous();
        let results = runner.run(&ctx, false).await;

        assert!(find(&results, "Application-only access token").passed);
        let permission = find(&results, "Application permission Group.Read.All");
        assert!(!permission.passed);
        assert!(permission.message.contains("GroupMember.Read.All"));
        let fix = permission.fix.as_ref().unwrap();
        assert_eq!(fix.operation, FixOperation::Replace);
        assert_eq!(fix.value, json!("GroupMember.Read.All"));
        assert!(find(&results, "Graph request as the application").passed);

        let cached = runner.run(&ctx, false).await;
        assert_eq!(cached, results);
        token_mock.assert_hits_async(1).await;
        graph_mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn unavailable_token_skips_permissions_distinctly() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(TOKEN_PATH);
                then.status(401).json_body(json!({
                    "error": "invalid_client",
                    "error_description": "AADSTS7000215: Invalid client secret provided."
                }));
            })
            .await;

        let mut config = test_config();
        config.oauth.authority_host = server.base_url();
        let results = runner(config).run(&RequestContext::anonymous(), true).await;

        assert!(!find(&results, "Application-only access token").passed);
        let permission = find(&results, "Application permission User.Read.All");
        assert!(!permission.passed);
        assert_eq!(permission.message, crate::permissions::TOKEN_UNAVAILABLE);
        assert_eq!(permission.data["token_available"], json!(false));
    }

    #[tokio::test]
    async fn applying_fix_invalidates_cache() {
        let mut config = test_config();
        config.graph.allow_all_endpoints = true;
        config.features.enabled.clear();
        let runner = runner(config.clone());
        let ctx = RequestContext::anonymous();

        let results = runner.run(&ctx, false).await;
        let fix = find(&results, "Graph endpoint allowlist").fix.clone().unwrap();
        runner.apply_fix(&mut config, &fix).unwrap();

        assert!(!config.graph.allow_all_endpoints);
        assert!(runner.cache.lock().unwrap().get(None).is_none());
    }
}
