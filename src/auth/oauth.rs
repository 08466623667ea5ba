//! OAuth2 client for the Azure AD token endpoint.
//!
//! Supports the authorization-code grant with PKCE (sign-in), the refresh-token
//! grant (silent renewal of delegated tokens) and the client-credentials grant
//! (application-only tokens). The application is a confidential client, so
//! every grant carries the client secret.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use url::Url;

use crate::config::Config;
use crate::error::BrokerError;

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (kept by the caller, sent in token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 hash of verifier, sent in auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let verifier_bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&verifier_bytes);
        Self::from_verifier(verifier)
    }

    /// Rebuild the pair from a verifier kept across the redirect.
    pub fn from_verifier(verifier: String) -> Self {
        // challenge = BASE64URL(SHA256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Token response from Azure AD.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
}

/// Error body returned by the token endpoint.
#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Which grant a token endpoint call performed; decides how failures are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
}

impl Grant {
    fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

/// OAuth2 client for Azure AD.
pub struct OAuth2Client {
    application_id: String,
    application_secret: zeroize::Zeroizing<String>,
    redirect_uri: String,
    auth_url: String,
    token_url: String,
    http_client: reqwest::Client,
}

impl OAuth2Client {
    /// Create a new OAuth2 client from configuration.
    pub fn new(config: &Config) -> Result<Self, BrokerError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.http.connect_timeout_seconds))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(BrokerError::Network)?;

        Ok(Self {
            application_id: config.oauth.application_id.clone(),
            application_secret: zeroize::Zeroizing::new(config.oauth.application_secret.clone()),
            redirect_uri: config.oauth.redirect_uri.clone(),
            auth_url: config.auth_url(),
            token_url: config.token_url(),
            http_client,
        })
    }

    /// Generate the authorization URL for browser-based sign-in.
    ///
    /// Returns the URL and a CSRF state token that must be verified in the callback.
    pub fn generate_auth_url(
        &self,
        pkce: &PkceChallenge,
        scopes: &[String],
    ) -> Result<(Url, String), BrokerError> {
        let mut rng = rand::thread_rng();
        let state_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        let state = URL_SAFE_NO_PAD.encode(&state_bytes);

        let mut url = Url::parse(&self.auth_url).map_err(|e| {
            BrokerError::Configuration(format!("invalid authorize endpoint {}: {e}", self.auth_url))
        })?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.application_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        Ok((url, state))
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        scope: &str,
    ) -> Result<TokenResponse, BrokerError> {
        let params = [
            ("client_id", self.application_id.as_str()),
            ("client_secret", self.application_secret.as_str()),
            ("grant_type", Grant::AuthorizationCode.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", pkce_verifier),
            ("scope", scope),
        ];
        self.request_token(Grant::AuthorizationCode, scope, &params).await
    }

    /// Refresh an access token using a refresh token.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        scope: &str,
    ) -> Result<TokenResponse, BrokerError> {
        let params = [
            ("client_id", self.application_id.as_str()),
            ("client_secret", self.application_secret.as_str()),
            ("grant_type", Grant::RefreshToken.as_str()),
            ("refresh_token", refresh_token),
            ("scope", scope),
        ];
        self.request_token(Grant::RefreshToken, scope, &params).await
    }

    /// Acquire an application-only token with the client-credentials grant.
    pub async fn client_credentials(&self, scope: &str) -> Result<TokenResponse, BrokerError> {
        let params = [
            ("client_id", self.application_id.as_str()),
            ("client_secret", self.application_secret.as_str()),
            ("grant_type", Grant::ClientCredentials.as_str()),
            ("scope", scope),
        ];
        self.request_token(Grant::ClientCredentials, scope, &params).await
    }

    async fn request_token(
        &self,
        grant: Grant,
        scope: &str,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, BrokerError> {
        debug!("Requesting token ({}) for scope {}", grant.as_str(), scope);

        let response = self
            .http_client
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| BrokerError::from_transport(&format!("token endpoint ({scope})"), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Log error details for debugging (doesn't expose to user)
            error!(
                "Token request ({}) failed: HTTP {} - {}",
                grant.as_str(),
                status,
                body
            );
            let detail: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            return Err(classify_failure(grant, status.as_u16(), scope, &detail));
        }

        let token_response: TokenResponse =
            response.json().await.map_err(|e| BrokerError::Conversion {
                endpoint: self.token_url.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "Acquired token ({}) for scope {}, expires in {}s",
            grant.as_str(),
            scope,
            token_response.expires_in
        );
        Ok(token_response)
    }
}

fn classify_failure(grant: Grant, status: u16, scope: &str, detail: &TokenErrorResponse) -> BrokerError {
    let reason = if detail.error_description.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("{}: {}", detail.error, detail.error_description)
    };

    if status >= 500 || status == 429 {
        return BrokerError::Transient(format!("token endpoint unavailable ({scope}): {reason}"));
    }

    match grant {
        Grant::ClientCredentials if detail.error == "invalid_client" || status == 401 => {
            BrokerError::Configuration(format!(
                "the identity provider rejected the application credentials ({reason}); \
                 check the application ID and secret"
            ))
        }
        Grant::ClientCredentials => BrokerError::Configuration(format!(
            "client credentials grant for {scope} failed ({reason})"
        )),
        Grant::AuthorizationCode | Grant::RefreshToken => {
            BrokerError::Unauthorized(format!("{} grant for {scope} rejected ({reason})", grant.as_str()))
        }
    }
}

/// Parse OAuth callback URL to extract code and state.
pub fn parse_callback_url(url_string: &str) -> Result<(String, String), BrokerError> {
    let url = Url::parse(url_string)
        .map_err(|e| BrokerError::BadRequest(format!("invalid callback URL: {e}")))?;

    let params: HashMap<_, _> = url.query_pairs().collect();

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|s| s.to_string())
            .unwrap_or_else(|| error.to_string());
        return Err(BrokerError::Unauthorized(description));
    }

    let code = params
        .get("code")
        .ok_or_else(|| BrokerError::BadRequest("callback is missing the authorization code".into()))?
        .to_string();

    let state = params
        .get("state")
        .ok_or_else(|| BrokerError::BadRequest("callback is missing the state parameter".into()))?
        .to_string();

    Ok((code, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_pkce_generation() {
        let pkce = PkceChallenge::new();
        assert!(!pkce.verifier.is_empty());
        assert_ne!(pkce.verifier, pkce.challenge);

        let rebuilt = PkceChallenge::from_verifier(pkce.verifier.clone());
        assert_eq!(rebuilt.challenge, pkce.challenge);
    }

    #[test]
    fn test_auth_url() {
        let client = OAuth2Client::new(&test_config()).unwrap();
        let pkce = PkceChallenge::new();
        let (url, state) = client
            .generate_auth_url(&pkce, &["openid".into(), "User.Read".into()])
            .unwrap();

        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["state"], state);
        assert_eq!(pairs["scope"], "openid User.Read");
        assert_eq!(pairs["code_challenge"], pkce.challenge);
        assert!(url.path().ends_with("/oauth2/v2.0/authorize"));
    }

    #[test]
    fn test_parse_callback_success() {
        let url = "http://localhost:28491/callback?code=abc123&state=xyz789";
        let (code, state) = parse_callback_url(url).unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state, "xyz789");
    }

    #[test]
    fn test_parse_callback_error() {
        let url = "http://localhost:28491/callback?error=access_denied&error_description=User%20cancelled";
        let result = parse_callback_url(url);
        assert!(matches!(result, Err(BrokerError::Unauthorized(msg)) if msg == "User cancelled"));
    }

    #[test]
    fn test_parse_callback_missing_code() {
        let url = "http://localhost:28491/callback?state=xyz789";
        assert!(matches!(parse_callback_url(url), Err(BrokerError::BadRequest(_))));
    }

    #[test]
    fn test_classify_failure() {
        let detail = TokenErrorResponse {
            error: "invalid_client".into(),
            error_description: "AADSTS7000215: Invalid client secret provided.".into(),
        };
        assert!(matches!(
            classify_failure(Grant::ClientCredentials, 401, "s", &detail),
            BrokerError::Configuration(_)
        ));
        assert!(matches!(
            classify_failure(Grant::RefreshToken, 400, "s", &detail),
            BrokerError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_failure(Grant::RefreshToken, 503, "s", &detail),
            BrokerError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_against_mock() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/contoso.onmicrosoft.com/oauth2/v2.0/token");
                then.status(200).json_body(json!({
                    "access_token": "app-token",
                    "token_type": "Bearer",
                    "expires_in": 3599
                }));
            })
            .await;

        let mut config = test_config();
        config.oauth.authority_host = server.base_url();
        let client = OAuth2Client::new(&config).unwrap();

        let response = client
            .client_credentials("https://graph.microsoft.com/.default")
            .await
            .unwrap();
        assert_eq!(response.access_token, "app-token");
        assert!(response.refresh_token.is_none());
        mock.assert_async().await;
    }
}
