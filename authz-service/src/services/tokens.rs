//! Scoped-token service.
//!
//! Mints, validates, and introspects the signed bearer tokens that embed a
//! principal's resolved permissions for exactly one organization. Symmetric
//! HMAC signing with a configured secret (>= 32 bytes).
//!
//! Refresh blacklists the old jti only after the new token is minted; both
//! tokens can verify for at most the clock-skew leeway. That window is
//! accepted: the blacklist is authoritative as soon as the refresh completes.

use authz_core::error::AuthzError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::models::{ClientContext, RoleRef, User};
use crate::services::permissions::permission_matches;

/// Accepted clock skew when validating expiry, in seconds.
const CLOCK_SKEW_LEEWAY_SECS: u64 = 300;

/// Principal block embedded in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUser {
    pub internal_id: Uuid,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub external_id: String,
}

impl From<&User> for TokenUser {
    fn from(user: &User) -> Self {
        Self {
            internal_id: user.id,
            email: user.email.clone(),
            name: user.full_name(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            external_id: user.external_id.clone(),
        }
    }
}

/// Organization block embedded in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenOrganization {
    pub id: Uuid,
    pub name: String,
    pub path: String,
}

/// Issuance metadata embedded in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub permission_count: usize,
    pub inherited_count: usize,
}

/// Full payload of a scoped access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub user: TokenUser,
    pub organization: TokenOrganization,
    pub permissions: Vec<String>,
    pub roles: Vec<RoleRef>,
    pub scope: String,
    pub includes_inherited: bool,
    pub metadata: TokenMetadata,
}

impl TokenClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Inputs for minting a token.
#[derive(Debug, Clone)]
pub struct MintRequest {
    pub user: TokenUser,
    pub organization: TokenOrganization,
    pub permissions: Vec<String>,
    pub roles: Vec<RoleRef>,
    pub includes_inherited: bool,
    pub inherited_count: usize,
    pub source: String,
    pub client: ClientContext,
}

/// A freshly minted token with its decoded payload.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub claims: TokenClaims,
}

/// Token service for scoped-token generation and validation.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    audience: String,
    expiration_minutes: i64,
    max_permissions: usize,
}

impl TokenService {
    pub fn new(config: &TokenConfig) -> Result<Self, AuthzError> {
        if config.secret.len() < 32 {
            return Err(AuthzError::ConfigError(anyhow::anyhow!(
                "token secret must be at least 32 bytes"
            )));
        }

        let algorithm = match config.algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(AuthzError::ConfigError(anyhow::anyhow!(
                    "unsupported token algorithm: {}",
                    other
                )))
            }
        };

        tracing::info!(algorithm = %config.algorithm, "token service initialized");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            algorithm,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            expiration_minutes: config.expiration_minutes,
            max_permissions: config.max_permissions,
        })
    }

    /// Mint a scoped token. The permission list is de-duplicated and sorted
    /// so construction is deterministic for a given resolved set.
    pub fn mint(&self, req: MintRequest) -> Result<MintedToken, AuthzError> {
        let mut permissions = req.permissions;
        permissions.sort();
        permissions.dedup();

        if permissions.len() > self.max_permissions {
            return Err(AuthzError::PermissionsCapacityExceeded {
                count: permissions.len(),
                max: self.max_permissions,
            });
        }

        let now = Utc::now();
        let exp = now + Duration::minutes(self.expiration_minutes);

        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: req.user.external_id.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: new_jti(),
            scope: format!("org:{}", req.organization.id),
            includes_inherited: req.includes_inherited,
            metadata: TokenMetadata {
                generated_at: now,
                source: req.source,
                ip: req.client.ip_address,
                user_agent: req.client.user_agent,
                session_id: req.client.session_id,
                permission_count: permissions.len(),
                inherited_count: req.inherited_count,
            },
            user: req.user,
            organization: req.organization,
            permissions,
            roles: req.roles,
        };

        let header = Header::new(self.algorithm);
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| AuthzError::SigningFailed(anyhow::anyhow!(e)))?;

        Ok(MintedToken {
            token,
            expires_at: exp,
            claims,
        })
    }

    /// Validate signature, issuer, audience, and expiry (with clock-skew
    /// leeway) and return the payload. The blacklist is checked by the
    /// coordinator, not here, so cold paths can validate without a database.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, AuthzError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.validate_exp = true;
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;

        let token_data = decode::<TokenClaims>(token, &self.decoding_key, &validation)?;
        Ok(token_data.claims)
    }

    /// Pull the jti out of a token without verifying the signature. Used by
    /// revocation flows, which must be able to blacklist tokens that no
    /// longer validate.
    pub fn extract_jti(&self, token: &str) -> Result<String, AuthzError> {
        let claims = self.extract_claims_unverified(token)?;
        Ok(claims.jti)
    }

    /// Decode the payload without signature verification.
    pub fn extract_claims_unverified(&self, token: &str) -> Result<TokenClaims, AuthzError> {
        let payload_segment = token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthzError::InvalidToken("malformed compact token".to_string()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_segment)
            .map_err(|e| AuthzError::InvalidToken(format!("payload not base64: {}", e)))?;

        serde_json::from_slice::<TokenClaims>(&payload)
            .map_err(|e| AuthzError::InvalidToken(format!("payload not a token payload: {}", e)))
    }

    /// Validate the token and check whether its permission set covers
    /// `permission`, honoring wildcard grants.
    pub fn has_permission(&self, token: &str, permission: &str) -> Result<bool, AuthzError> {
        let claims = self.validate(token)?;
        Ok(claims
            .permissions
            .iter()
            .any(|held| permission_matches(held, permission)))
    }

    /// `has_permission` for a `(resource, action)` pair.
    pub fn has_resource_action(
        &self,
        token: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, AuthzError> {
        self.has_permission(token, &format!("{}:{}", resource, action))
    }

    pub fn expiration_minutes(&self) -> i64 {
        self.expiration_minutes
    }
}

/// 128-bit random id, URL-safe base64, never reused.
fn new_jti() -> String {
    let bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_config() -> TokenConfig {
        TokenConfig {
            secret: "test-secret-test-secret-test-secret!".to_string(),
            issuer: "authz-service".to_string(),
            audience: "authz-clients".to_string(),
            expiration_minutes: 60,
            max_permissions: 500,
            algorithm: "HS256".to_string(),
        }
    }

    fn sample_request() -> MintRequest {
        MintRequest {
            user: TokenUser {
                internal_id: Uuid::new_v4(),
                email: "a@b.c".to_string(),
                name: "Ada Lovelace".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                external_id: "idp|123".to_string(),
            },
            organization: TokenOrganization {
                id: Uuid::new_v4(),
                name: "Acme".to_string(),
                path: "admin.acme".to_string(),
            },
            permissions: vec!["repos:read".to_string(), "repos:write".to_string()],
            roles: vec![RoleRef {
                id: Uuid::new_v4(),
                name: "dev".to_string(),
                is_inheritable: true,
            }],
            includes_inherited: true,
            inherited_count: 1,
            source: "login".to_string(),
            client: ClientContext::default(),
        }
    }

    #[test]
    fn test_mint_and_validate_round_trip() {
        let service = TokenService::new(&test_config()).unwrap();
        let minted = service.mint(sample_request()).unwrap();

        let claims = service.validate(&minted.token).unwrap();
        assert_eq!(claims.sub, "idp|123");
        assert_eq!(claims.permissions, vec!["repos:read", "repos:write"]);
        assert_eq!(claims.jti, minted.claims.jti);
        assert_eq!(claims.scope, format!("org:{}", claims.organization.id));
        assert_eq!(claims.metadata.permission_count, 2);
        assert!(claims.includes_inherited);
    }

    #[test]
    fn test_mint_sorts_and_dedups_permissions() {
        let service = TokenService::new(&test_config()).unwrap();
        let mut req = sample_request();
        req.permissions = vec![
            "z:last".to_string(),
            "a:first".to_string(),
            "a:first".to_string(),
        ];
        let minted = service.mint(req).unwrap();
        assert_eq!(minted.claims.permissions, vec!["a:first", "z:last"]);
        assert_eq!(minted.claims.metadata.permission_count, 2);
    }

    #[test]
    fn test_jti_unique_across_mints() {
        let service = TokenService::new(&test_config()).unwrap();
        let jtis: HashSet<String> = (0..100)
            .map(|_| service.mint(sample_request()).unwrap().claims.jti)
            .collect();
        assert_eq!(jtis.len(), 100);
    }

    #[test]
    fn test_mint_rejects_oversized_permission_set() {
        let config = TokenConfig {
            max_permissions: 3,
            ..test_config()
        };
        let service = TokenService::new(&config).unwrap();
        let mut req = sample_request();
        req.permissions = (0..4).map(|i| format!("res{}:read", i)).collect();

        let err = service.mint(req).unwrap_err();
        assert!(matches!(
            err,
            AuthzError::PermissionsCapacityExceeded { count: 4, max: 3 }
        ));
    }

    #[test]
    fn test_validate_rejects_expired_token() {
        let service = TokenService::new(&test_config()).unwrap();
        let mut req_claims = service.mint(sample_request()).unwrap().claims;
        // Expired beyond the 5-minute leeway.
        req_claims.exp = Utc::now().timestamp() - 400;
        req_claims.iat = req_claims.exp - 60;

        let stale = encode(
            &Header::new(Algorithm::HS256),
            &req_claims,
            &EncodingKey::from_secret(test_config().secret.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            service.validate(&stale).unwrap_err(),
            AuthzError::TokenExpired
        ));
    }

    #[test]
    fn test_validate_within_leeway() {
        let service = TokenService::new(&test_config()).unwrap();
        let mut claims = service.mint(sample_request()).unwrap().claims;
        // Just past expiry but inside the leeway window.
        claims.exp = Utc::now().timestamp() - 60;

        let near_expired = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(test_config().secret.as_bytes()),
        )
        .unwrap();

        assert!(service.validate(&near_expired).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_secret() {
        let service = TokenService::new(&test_config()).unwrap();
        let other = TokenService::new(&TokenConfig {
            secret: "another-secret-another-secret-another!".to_string(),
            ..test_config()
        })
        .unwrap();

        let minted = other.mint(sample_request()).unwrap();
        assert!(matches!(
            service.validate(&minted.token).unwrap_err(),
            AuthzError::SignatureInvalid
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_audience() {
        let service = TokenService::new(&test_config()).unwrap();
        let other = TokenService::new(&TokenConfig {
            audience: "some-other-audience".to_string(),
            ..test_config()
        })
        .unwrap();

        let minted = other.mint(sample_request()).unwrap();
        assert!(service.validate(&minted.token).is_err());
    }

    #[test]
    fn test_rejects_short_secret() {
        let config = TokenConfig {
            secret: "too-short".to_string(),
            ..test_config()
        };
        assert!(TokenService::new(&config).is_err());
    }

    #[test]
    fn test_extract_jti_without_validation() {
        let service = TokenService::new(&test_config()).unwrap();
        let minted = service.mint(sample_request()).unwrap();

        // extract_jti works even with a foreign signing key.
        let other = TokenService::new(&TokenConfig {
            secret: "another-secret-another-secret-another!".to_string(),
            ..test_config()
        })
        .unwrap();
        assert_eq!(other.extract_jti(&minted.token).unwrap(), minted.claims.jti);
    }

    #[test]
    fn test_extract_jti_rejects_garbage() {
        let service = TokenService::new(&test_config()).unwrap();
        assert!(service.extract_jti("not-a-token").is_err());
        assert!(service.extract_jti("a.b.c").is_err());
    }

    #[test]
    fn test_has_permission_exact_and_wildcard() {
        let service = TokenService::new(&test_config()).unwrap();
        let mut req = sample_request();
        req.permissions = vec!["repos:read".to_string(), "billing:*".to_string()];
        let minted = service.mint(req).unwrap();

        assert!(service.has_permission(&minted.token, "repos:read").unwrap());
        assert!(service
            .has_permission(&minted.token, "billing:delete")
            .unwrap());
        assert!(!service.has_permission(&minted.token, "repos:write").unwrap());
        assert!(service
            .has_resource_action(&minted.token, "billing", "read")
            .unwrap());
    }
}
