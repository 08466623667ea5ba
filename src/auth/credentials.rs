//! Format checks for the application registration credentials.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::OAuthConfig;
use crate::error::BrokerError;

static APPLICATION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-5][0-9a-f]{3}-[089ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("static application id pattern")
});

/// Any-case GUID shape, used to spot a secret ID pasted as the secret.
static GUID_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("static GUID pattern")
});

/// Returns true if `value` is a lowercase GUID as Azure AD displays application ids.
pub fn is_guid(value: &str) -> bool {
    APPLICATION_ID.is_match(value)
}

/// Validate an application (client) id.
pub fn validate_application_id(application_id: &str) -> Result<(), BrokerError> {
    if application_id.trim().is_empty() {
        return Err(BrokerError::Configuration(
            "Application (client) ID is missing. Copy it from the Overview page of the \
             app registration in Azure AD."
                .into(),
        ));
    }

    if !is_guid(application_id) {
        return Err(BrokerError::Configuration(format!(
            "Application (client) ID '{application_id}' is not a valid GUID. Copy the \
             Application (client) ID from the Overview page of the app registration."
        )));
    }

    Ok(())
}

/// Validate an application secret.
///
/// A secret with GUID shape is almost always the secret's ID pasted instead of its value.
pub fn validate_application_secret(secret: &str) -> Result<(), BrokerError> {
    if secret.trim().is_empty() {
        return Err(BrokerError::Configuration(
            "Application secret is missing. Create a client secret on the Certificates & \
             secrets page of the app registration."
                .into(),
        ));
    }

    if GUID_SHAPE.is_match(secret.trim()) {
        return Err(BrokerError::Configuration(
            "Application secret looks like a GUID. You probably copied the secret ID instead \
             of the secret value; copy the Value column of the client secret."
                .into(),
        ));
    }

    Ok(())
}

/// Validate the tenant id.
pub fn validate_tenant(tenant: &str) -> Result<(), BrokerError> {
    if tenant.trim().is_empty() {
        return Err(BrokerError::Configuration(
            "Directory (tenant) ID is missing. Copy it from the Overview page of the app \
             registration."
                .into(),
        ));
    }
    Ok(())
}

/// Validate everything a client-credentials or refresh grant needs.
pub fn validate_app_credentials(oauth: &OAuthConfig) -> Result<(), BrokerError> {
    validate_tenant(&oauth.tenant)?;
    validate_application_id(&oauth.application_id)?;
    validate_application_secret(&oauth.application_secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_application_ids() {
        assert!(validate_application_id("3f2504e0-4f89-41d3-9a0c-0305e82c3301").is_ok());
        assert!(validate_application_id("00000000-0000-0000-0000-000000000000").is_ok());
    }

    #[test]
    fn test_invalid_application_ids() {
        for id in [
            "",
            "not-a-guid",
            "3F2504E0-4F89-41D3-9A0C-0305E82C3301",
            // version nibble out of range
            "3f2504e0-4f89-61d3-9a0c-0305e82c3301",
            // variant nibble out of range
            "3f2504e0-4f89-41d3-ca0c-0305e82c3301",
            // trailing garbage of any length
            "3f2504e0-4f89-41d3-9a0c-0305e82c3301x",
            "{3f2504e0-4f89-41d3-9a0c-0305e82c3301}",
        ] {
            assert!(
                matches!(validate_application_id(id), Err(BrokerError::Configuration(_))),
                "accepted {id}"
            );
        }
    }

    #[test]
    fn test_secret_that_looks_like_guid() {
        let err = validate_application_secret("3f2504e0-4f89-41d3-9a0c-0305e82c3301").unwrap_err();
        assert!(err.to_string().contains("secret ID"));
        let err = validate_application_secret("3F2504E0-4F89-41D3-9A0C-0305E82C3301").unwrap_err();
        assert!(err.to_string().contains("secret ID"));
        assert!(validate_application_secret("Abc8Q~s3cr3t.value").is_ok());
        assert!(validate_application_secret("  ").is_err());
    }
}
