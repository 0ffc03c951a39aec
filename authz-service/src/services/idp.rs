//! Outbound identity-provider boundary.
//!
//! The code-for-token exchange and profile fetch are external collaborators;
//! everything behind this trait is replaceable, and tests use the mock.

use async_trait::async_trait;
use authz_core::error::AuthzError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::IdpConfig;

/// Profile returned by the identity provider after a successful exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpProfile {
    /// The provider's stable subject identifier.
    pub external_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub picture: Option<String>,
    pub email_verified: bool,
}

/// Result of exchanging an authorization code.
#[derive(Debug, Clone)]
pub struct IdpExchange {
    pub access_token: String,
    pub id_token: Option<String>,
    pub profile: IdpProfile,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange an authorization code for tokens and the user profile.
    async fn exchange_code(&self, code: &str) -> Result<IdpExchange, AuthzError>;

    /// Build the provider's authorization URL for the login redirect.
    fn authorize_url(&self, state: &str) -> String;
}

/// Response from the provider's token endpoint.
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    id_token: Option<String>,
}

/// Claims of the provider's userinfo endpoint.
#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    sub: String,
    email: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    name: Option<String>,
    picture: Option<String>,
    email_verified: Option<bool>,
}

/// OIDC provider speaking the standard token + userinfo endpoints.
#[derive(Clone)]
pub struct OidcProvider {
    config: IdpConfig,
    http: reqwest::Client,
}

impl OidcProvider {
    pub fn new(config: IdpConfig) -> Result<Self, AuthzError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AuthzError::ConfigError(anyhow::anyhow!(e)))?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.authority.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn exchange_code(&self, code: &str) -> Result<IdpExchange, AuthzError> {
        let token_response = self
            .http
            .post(self.endpoint("oauth/token"))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("redirect_uri", &self.config.redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthzError::ExternalTimeout
                } else {
                    AuthzError::IdpExchangeFailed(anyhow::anyhow!(e))
                }
            })?;

        if !token_response.status().is_success() {
            let status = token_response.status();
            tracing::warn!(status = %status, "identity provider rejected code exchange");
            return Err(AuthzError::AuthorizationCodeInvalid);
        }

        let tokens: TokenEndpointResponse = token_response
            .json()
            .await
            .map_err(|e| AuthzError::IdpApiError(anyhow::anyhow!(e)))?;

        let userinfo_response = self
            .http
            .get(self.endpoint("userinfo"))
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthzError::ExternalTimeout
                } else {
                    AuthzError::IdpApiError(anyhow::anyhow!(e))
                }
            })?;

        if !userinfo_response.status().is_success() {
            return Err(AuthzError::IdpProfileMissing);
        }

        let info: UserInfoResponse = userinfo_response
            .json()
            .await
            .map_err(|e| AuthzError::IdpApiError(anyhow::anyhow!(e)))?;

        let email = info.email.ok_or(AuthzError::IdpProfileMissing)?;

        // Prefer explicit given/family names; fall back to splitting the
        // display name.
        let (first_name, last_name) = match (info.given_name, info.family_name) {
            (Some(first), Some(last)) => (first, last),
            (first, last) => {
                let display = info.name.unwrap_or_default();
                let mut parts = display.splitn(2, ' ');
                (
                    first.unwrap_or_else(|| parts.next().unwrap_or_default().to_string()),
                    last.unwrap_or_else(|| parts.next().unwrap_or_default().to_string()),
                )
            }
        };

        Ok(IdpExchange {
            access_token: tokens.access_token,
            id_token: tokens.id_token,
            profile: IdpProfile {
                external_id: info.sub,
                email,
                first_name,
                last_name,
                picture: info.picture,
                email_verified: info.email_verified.unwrap_or(false),
            },
        })
    }

    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.endpoint("authorize"),
            url_encode(&self.config.client_id),
            url_encode(&self.config.redirect_uri),
            url_encode(&self.config.scope),
            url_encode(state),
        )
    }
}

/// Percent-encode a query component.
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// In-process provider for tests: maps codes to canned profiles.
pub struct MockIdentityProvider {
    profiles: std::sync::Mutex<std::collections::HashMap<String, IdpProfile>>,
}

impl Default for MockIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self {
            profiles: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn register_code(&self, code: &str, profile: IdpProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(code.to_string(), profile);
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn exchange_code(&self, code: &str) -> Result<IdpExchange, AuthzError> {
        let profile = self
            .profiles
            .lock()
            .unwrap()
            .get(code)
            .cloned()
            .ok_or(AuthzError::AuthorizationCodeInvalid)?;

        Ok(IdpExchange {
            access_token: format!("mock-access-{}", code),
            id_token: None,
            profile,
        })
    }

    fn authorize_url(&self, state: &str) -> String {
        format!("https://idp.example.com/authorize?state={}", state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("openid profile email"), "openid%20profile%20email");
        assert_eq!(url_encode("https://a/b"), "https%3A%2F%2Fa%2Fb");
        assert_eq!(url_encode("plain-safe_chars.~"), "plain-safe_chars.~");
    }

    #[tokio::test]
    async fn test_mock_provider_round_trip() {
        let mock = MockIdentityProvider::new();
        mock.register_code(
            "good-code",
            IdpProfile {
                external_id: "idp|1".to_string(),
                email: "a@b.c".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                picture: None,
                email_verified: true,
            },
        );

        let exchange = mock.exchange_code("good-code").await.unwrap();
        assert_eq!(exchange.profile.external_id, "idp|1");

        let err = mock.exchange_code("bad-code").await.unwrap_err();
        assert!(matches!(err, AuthzError::AuthorizationCodeInvalid));
    }
}
