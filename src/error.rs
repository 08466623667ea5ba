//! Error types for the broker.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use thiserror::Error;

/// Errors produced by the token broker, the permission checks and the Graph executor.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No usable token: the principal must sign in (again).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The endpoint or capability is not allowed by policy.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Missing or malformed application id, secret or tenant.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Graph answered with a status outside 200..=299.
    #[error("Graph request to {endpoint} failed with HTTP {status}")]
    GraphFetch {
        status: u16,
        body: String,
        endpoint: String,
    },

    /// The response was not valid JSON.
    #[error("Failed to convert response from {endpoint}: {reason}")]
    Conversion { endpoint: String, reason: String },

    /// Timeout or connection failure; the call may succeed when retried.
    #[error("Transient network failure: {0}")]
    Transient(String),

    /// The caller supplied an invalid request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Token store error: {0}")]
    Store(#[from] StoreError),
}

/// Token store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read token store: {0}")]
    ReadFailed(String),

    #[error("Failed to write token store: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Classify a `reqwest` failure: timeouts and connection failures are transient.
    pub fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(format!("{context}: {err}"))
        } else {
            Self::Network(err)
        }
    }

    /// HTTP status code used at the REST boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            _ => 500,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Configuration(_) => "configuration_error",
            Self::GraphFetch { .. } => "graph_fetch_error",
            Self::Conversion { .. } => "conversion_error",
            Self::Transient(_) => "transient_error",
            Self::BadRequest(_) => "bad_request",
            Self::Network(_) => "network_error",
            Self::Store(_) => "store_error",
        }
    }

    /// Returns a user-friendly message for display to an administrator or end user.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Unauthorized(_) => "Session expired or missing. Please sign in again.",
            Self::Forbidden(_) => "This request is not allowed by the current configuration.",
            Self::Configuration(_) => "Configuration error. Run the self-test for details.",
            Self::GraphFetch { .. } => "Microsoft Graph returned an error.",
            Self::Conversion { .. } => "Unexpected response from Microsoft Graph.",
            Self::Transient(_) => "Network timeout. Please try again.",
            Self::BadRequest(_) => "The request is invalid.",
            Self::Network(_) => "Network error. Check your connection.",
            Self::Store(_) => "Failed to access the token cache.",
        }
    }

    /// Returns true if repeating the call unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns true if this error should send the principal back to sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BrokerError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(BrokerError::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(BrokerError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(BrokerError::Configuration("x".into()).status_code(), 500);
        let fetch = BrokerError::GraphFetch {
            status: 403,
            body: "{}".into(),
            endpoint: "/me".into(),
        };
        assert_eq!(fetch.status_code(), 500);
        assert_eq!(fetch.code(), "graph_fetch_error");
    }

    #[test]
    fn test_user_messages() {
        let err = BrokerError::Unauthorized("no token".into());
        assert_eq!(err.user_message(), "Session expired or missing. Please sign in again.");
        assert!(err.requires_sign_in());

        let err = BrokerError::Forbidden("endpoint".into());
        assert!(!err.requires_sign_in());
    }

    #[test]
    fn test_retryable() {
        assert!(BrokerError::Transient("timeout".into()).is_retryable());
        assert!(!BrokerError::Forbidden("x".into()).is_retryable());
    }
}
