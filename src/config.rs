//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml, an optional file on disk, and
//! environment variable overrides. Components receive the resulting [`Config`]
//! at construction time; nothing reads configuration through globals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};

use crate::diagnostics::{Fix, FixOperation};
use crate::error::BrokerError;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub oauth: OAuthConfig,
    pub graph: GraphConfig,
    pub http: HttpConfig,
    pub token: TokenConfig,
    pub features: FeaturesConfig,
    pub diagnostics: DiagnosticsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub tenant: String,
    pub application_id: String,
    pub application_secret: String,
    pub redirect_uri: String,
    pub authority_host: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Top-level domain of the national cloud (`com`, `us`, `de`, ...).
    pub tld: String,
    pub version: String,
    /// Overrides the host derived from `tld`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub allow_all_endpoints: bool,
    pub skip_tls_verify: bool,
    #[serde(default)]
    pub allowed_endpoints: Vec<AllowedEndpoint>,
}

/// Allowlist entry: endpoint prefix and whether application-only access is permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedEndpoint {
    pub prefix: String,
    #[serde(default)]
    pub application: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub refresh_before_expiry_seconds: u64,
    pub store: StoreKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    pub cache_minutes: i64,
    #[serde(default)]
    pub delegated_permissions: Vec<String>,
    #[serde(default)]
    pub application_permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config: Config =
            toml::from_str(CONFIG_TOML).context("Failed to parse embedded config.toml")?;
        config.finish()
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides();
        self.validate()?;
        Ok(self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(tenant) = env::var("AZURE_TENANT_ID") {
            self.oauth.tenant = tenant;
        }

        if let Ok(client_id) = env::var("AZURE_CLIENT_ID") {
            self.oauth.application_id = client_id;
        }

        if let Ok(secret) = env::var("AZURE_CLIENT_SECRET") {
            self.oauth.application_secret = secret;
        }

        if let Ok(redirect_uri) = env::var("AZURE_REDIRECT_URI") {
            self.oauth.redirect_uri = redirect_uri;
        }

        if let Ok(tld) = env::var("GRAPH_TLD") {
            self.graph.tld = tld;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    /// Structural validation only.
    ///
    /// Missing or malformed credentials are not rejected here; the broker reports
    /// them as configuration errors and the self-test explains how to fix them.
    fn validate(&self) -> Result<()> {
        if self.graph.tld.trim().is_empty() {
            anyhow::bail!("graph.tld must not be empty (use \"com\" for the global cloud)");
        }

        if self.graph.version.trim().is_empty() {
            anyhow::bail!("graph.version must not be empty (e.g. \"v1.0\" or \"beta\")");
        }

        if self.http.timeout_seconds == 0 {
            anyhow::bail!("http.timeout_seconds must be greater than zero");
        }

        Ok(())
    }

    /// Get the authorization URL for Azure AD.
    pub fn auth_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/authorize",
            self.oauth.authority_host.trim_end_matches('/'),
            self.oauth.tenant
        )
    }

    /// Get the token URL for Azure AD.
    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.oauth.authority_host.trim_end_matches('/'),
            self.oauth.tenant
        )
    }

    /// Graph host without trailing slash, e.g. `https://graph.microsoft.com`.
    pub fn graph_host(&self) -> String {
        match &self.graph.host {
            Some(host) => host.trim_end_matches('/').to_string(),
            None => format!("https://graph.microsoft.{}", self.graph.tld),
        }
    }

    /// Scope requesting every application permission granted to the app.
    pub fn graph_default_scope(&self) -> String {
        format!("https://graph.microsoft.{}/.default", self.graph.tld)
    }

    /// Apply an administrator-approved fix to this configuration.
    pub fn apply_fix(&mut self, fix: &Fix) -> Result<(), BrokerError> {
        match fix.option.as_str() {
            "graph.allow_all_endpoints" => {
                self.graph.allow_all_endpoints = fix_bool(fix)?;
            }
            "graph.skip_tls_verify" => {
                self.graph.skip_tls_verify = fix_bool(fix)?;
            }
            "graph.allowed_endpoints" => {
                let entry: AllowedEndpoint = serde_json::from_value(fix.value.clone())
                    .map_err(|e| BrokerError::Configuration(format!("invalid allowlist entry: {e}")))?;
                match fix.operation {
                    FixOperation::Add => {
                        if !self.graph.allowed_endpoints.contains(&entry) {
                            self.graph.allowed_endpoints.push(entry);
                        }
                    }
                    FixOperation::Remove => {
                        self.graph.allowed_endpoints.retain(|e| e.prefix != entry.prefix);
                    }
                    _ => return Err(unsupported(fix)),
                }
            }
            "features.enabled" => apply_list_fix(&mut self.features.enabled, fix)?,
            "diagnostics.delegated_permissions" => {
                apply_list_fix(&mut self.diagnostics.delegated_permissions, fix)?
            }
            "diagnostics.application_permissions" => {
                apply_list_fix(&mut self.diagnostics.application_permissions, fix)?
            }
            other => {
                return Err(BrokerError::Configuration(format!(
                    "option '{other}' cannot be changed by a fix"
                )))
            }
        }
        Ok(())
    }
}

fn unsupported(fix: &Fix) -> BrokerError {
    BrokerError::Configuration(format!(
        "operation {:?} is not supported for option '{}'",
        fix.operation, fix.option
    ))
}

fn fix_bool(fix: &Fix) -> Result<bool, BrokerError> {
    if fix.operation != FixOperation::Set {
        return Err(unsupported(fix));
    }
    fix.value.as_bool().ok_or_else(|| {
        BrokerError::Configuration(format!("option '{}' expects a boolean", fix.option))
    })
}

fn fix_string(value: &Value, option: &str) -> Result<String, BrokerError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BrokerError::Configuration(format!("option '{option}' expects strings")))
}

fn apply_list_fix(list: &mut Vec<String>, fix: &Fix) -> Result<(), BrokerError> {
    let value = fix_string(&fix.value, &fix.option)?;
    match fix.operation {
        FixOperation::Add => {
            if !list.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
                list.push(value);
            }
        }
        FixOperation::Remove => list.retain(|v| !v.eq_ignore_ascii_case(&value)),
        FixOperation::Replace => {
            let previous = fix
                .previous
                .as_ref()
                .ok_or_else(|| BrokerError::Configuration("replace fix without previous value".into()))
                .and_then(|p| fix_string(p, &fix.option))?;
            list.retain(|v| !v.eq_ignore_ascii_case(&previous));
            if !list.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
                list.push(value);
            }
        }
        FixOperation::Set => return Err(unsupported(fix)),
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let mut config: Config = toml::from_str(CONFIG_TOML).unwrap();
    config.oauth.tenant = "contoso.onmicrosoft.com".into();
    config.oauth.application_id = "3f2504e0-4f89-41d3-9a0c-0305e82c3301".into();
    config.oauth.application_secret = "Abc8Q~s3cr3t.value_notaguid".into();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_parsing() {
        let result = toml::from_str::<Config>(CONFIG_TOML);
        assert!(result.is_ok(), "Config parsing failed: {:?}", result.err());
        let config = result.unwrap();
        assert!(!config.graph.allow_all_endpoints);
        assert!(config
            .graph
            .allowed_endpoints
            .iter()
            .any(|e| e.prefix == "/users" && e.application));
        assert_eq!(config.token.store, StoreKind::File);
    }

    #[test]
    fn test_urls() {
        let config = test_config();

        assert_eq!(
            config.auth_url(),
            "https://login.microsoftonline.com/contoso.onmicrosoft.com/oauth2/v2.0/authorize"
        );
        assert_eq!(
            config.token_url(),
            "https://login.microsoftonline.com/contoso.onmicrosoft.com/oauth2/v2.0/token"
        );
        assert_eq!(config.graph_host(), "https://graph.microsoft.com");
        assert_eq!(config.graph_default_scope(), "https://graph.microsoft.com/.default");
    }

    #[test]
    fn test_graph_host_follows_tld() {
        let mut config = test_config();
        config.graph.tld = "us".into();
        assert_eq!(config.graph_host(), "https://graph.microsoft.us");

        config.graph.host = Some("http://127.0.0.1:9000/".into());
        assert_eq!(config.graph_host(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_apply_bool_fix() {
        let mut config = test_config();
        config.graph.allow_all_endpoints = true;

        let fix = Fix::set("graph.allow_all_endpoints", json!(false));
        config.apply_fix(&fix).unwrap();
        assert!(!config.graph.allow_all_endpoints);

        let bad = Fix::set("graph.allow_all_endpoints", json!("nope"));
        assert!(matches!(config.apply_fix(&bad), Err(BrokerError::Configuration(_))));
    }

    #[test]
    fn test_apply_replace_fix() {
        let mut config = test_config();
        config.diagnostics.application_permissions = vec!["Group.Read.All".into()];

        let fix = Fix::replace(
            "diagnostics.application_permissions",
            json!("Group.Read.All"),
            json!("GroupMember.Read.All"),
        );
        config.apply_fix(&fix).unwrap();
        assert_eq!(
            config.diagnostics.application_permissions,
            vec!["GroupMember.Read.All".to_string()]
        );
    }

    #[test]
    fn test_apply_allowlist_fix() {
        let mut config = test_config();
        let fix = Fix::add(
            "graph.allowed_endpoints",
            json!({ "prefix": "/teams", "application": true }),
        );
        config.apply_fix(&fix).unwrap();
        assert!(config.graph.allowed_endpoints.iter().any(|e| e.prefix == "/teams"));

        let unknown = Fix::set("oauth.application_secret", json!("x"));
        assert!(config.apply_fix(&unknown).is_err());
    }
}
