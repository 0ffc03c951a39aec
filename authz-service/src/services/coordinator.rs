//! Auth coordinator.
//!
//! The only component that holds the full story: IdP exchange, user
//! resolution/provisioning, organization pick, permission resolution, token
//! mint, and the authorization step for inbound protected calls. Everything
//! stateful is reached through the fabric; the coordinator itself is
//! stateless between requests.

use authz_core::error::AuthzError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::fabric::messages::{
    BlacklistTokenRequest, CheckTokenBlacklistRequest, CreateUserRequest,
    GetUserOrganizationsRequest, GetUserPermissionsRequest, LogAuthenticationEvent,
    ResolveUserRequest,
};
use crate::fabric::Fabric;
use crate::models::{emergency_jti, AuditCategory, ClientContext, PermissionCheck, RoleRef, User};
use crate::services::idp::IdentityProvider;
use crate::services::organizations::pick_login_organization;
use crate::services::permissions::permission_matches;
use crate::services::tokens::{
    MintRequest, TokenClaims, TokenOrganization, TokenService, TokenUser,
};

/// Result of a completed login or refresh.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: TokenUser,
    pub organization: TokenOrganization,
    pub permissions: Vec<String>,
    pub roles: Vec<RoleRef>,
    pub is_new_user: bool,
}

/// Introspection payload for `GetUserContext`.
#[derive(Debug, Clone, Serialize)]
pub struct UserContext {
    pub user: TokenUser,
    pub organization: TokenOrganization,
    pub permissions: Vec<String>,
    pub roles: Vec<RoleRef>,
    pub expires_at: DateTime<Utc>,
}

/// Result of `CheckPermissions`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckPermissionsResult {
    pub results: Vec<PermissionCheck>,
    pub has_all: bool,
    pub has_any: bool,
}

pub struct AuthCoordinator {
    fabric: Arc<Fabric>,
    tokens: TokenService,
    idp: Arc<dyn IdentityProvider>,
}

impl AuthCoordinator {
    pub fn new(fabric: Arc<Fabric>, tokens: TokenService, idp: Arc<dyn IdentityProvider>) -> Self {
        Self {
            fabric,
            tokens,
            idp,
        }
    }

    /// Authorization URL for the login redirect.
    pub fn build_authorization_url(&self) -> String {
        self.idp.authorize_url(&Uuid::new_v4().to_string())
    }

    /// The end-to-end success path: code exchange, resolve-or-create,
    /// organization pick, permission resolution, mint, audit.
    #[tracing::instrument(skip(self, code, ctx, cancel))]
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        ctx: ClientContext,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, AuthzError> {
        let exchange = match self.idp.exchange_code(code).await {
            Ok(exchange) => exchange,
            Err(e) => {
                self.log_auth_event(
                    None,
                    None,
                    "LOGIN",
                    false,
                    serde_json::json!({ "stage": "idp_exchange" }),
                    Some(e.to_string()),
                    &ctx,
                )
                .await;
                return Err(e);
            }
        };
        let profile = exchange.profile;

        let resolved = self
            .fabric
            .request_with_cancel(
                ResolveUserRequest {
                    external_id: profile.external_id.clone(),
                    profile_hint: Some(profile.clone()),
                },
                cancel,
            )
            .await?;

        let (user, is_new_user) = match resolved.user {
            Some(user) => (user, false),
            None => {
                let created = self
                    .fabric
                    .request_with_cancel(
                        CreateUserRequest {
                            external_id: profile.external_id.clone(),
                            email: profile.email.clone(),
                            first_name: profile.first_name.clone(),
                            last_name: profile.last_name.clone(),
                            profile_picture_url: profile.picture.clone(),
                            source: "oidc".to_string(),
                            metadata: serde_json::Value::Null,
                        },
                        cancel,
                    )
                    .await
                    .map_err(|e| match e {
                        AuthzError::ExternalIdInvalid(detail) => {
                            AuthzError::ExternalIdInvalid(detail)
                        }
                        other => AuthzError::UserProvisioningFailed(anyhow::anyhow!(other)),
                    })?;
                (created.user, true)
            }
        };

        let result = self
            .issue_token_for(&user, is_new_user, &ctx, cancel)
            .await?;

        self.log_auth_event(
            Some(user.id),
            Some(result.organization.id),
            if is_new_user { "FIRST_LOGIN" } else { "LOGIN" },
            true,
            serde_json::json!({
                "jti": self.tokens.extract_jti(&result.token).ok(),
                "permission_count": result.permissions.len(),
                "role_count": result.roles.len(),
            }),
            None,
            &ctx,
        )
        .await;

        Ok(result)
    }

    /// Validate a token cryptographically (signature, issuer, audience,
    /// expiry). Revocation is a separate, database-backed concern; use
    /// `authorized_claims` for the full check.
    pub fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthzError> {
        self.tokens.validate(token)
    }

    /// Full authorization of a bearer token: cryptographic validation, then
    /// jti and emergency blacklist lookups.
    pub async fn authorized_claims(&self, token: &str) -> Result<TokenClaims, AuthzError> {
        let claims = self.tokens.validate(token)?;

        let status = self
            .fabric
            .request(CheckTokenBlacklistRequest {
                jti: claims.jti.clone(),
                user_id: Some(claims.user.internal_id),
                organization_id: Some(claims.organization.id),
            })
            .await?;

        if status.is_blacklisted {
            return Err(AuthzError::TokenBlacklisted);
        }

        Ok(claims)
    }

    /// Authorize an inbound protected call that requires `permission`.
    pub async fn authorize(
        &self,
        token: &str,
        permission: &str,
    ) -> Result<TokenClaims, AuthzError> {
        let claims = self.authorized_claims(token).await?;

        let allowed = claims
            .permissions
            .iter()
            .any(|held| permission_matches(held, permission));
        if !allowed {
            return Err(AuthzError::MissingPermission(permission.to_string()));
        }

        Ok(claims)
    }

    /// Introspect a token for its owner.
    pub async fn get_user_context(&self, token: &str) -> Result<UserContext, AuthzError> {
        let claims = self.authorized_claims(token).await?;
        Ok(UserContext {
            expires_at: claims.expires_at(),
            user: claims.user,
            organization: claims.organization,
            permissions: claims.permissions,
            roles: claims.roles,
        })
    }

    /// Check a batch of permissions against a token's embedded set. The
    /// caller is inspecting itself, so per-permission answers are returned.
    pub async fn check_permissions(
        &self,
        token: &str,
        permissions: &[String],
    ) -> Result<CheckPermissionsResult, AuthzError> {
        let claims = self.authorized_claims(token).await?;

        let results: Vec<PermissionCheck> = permissions
            .iter()
            .map(|required| PermissionCheck {
                permission: required.clone(),
                has_permission: claims
                    .permissions
                    .iter()
                    .any(|held| permission_matches(held, required)),
            })
            .collect();

        let has_all = results.iter().all(|r| r.has_permission);
        let has_any = results.iter().any(|r| r.has_permission);

        Ok(CheckPermissionsResult {
            results,
            has_all,
            has_any,
        })
    }

    /// Refresh: validate, re-resolve everything through the fabric, mint the
    /// successor, then blacklist the old jti. The old token stays
    /// cryptographically valid for at most the clock-skew window; the
    /// blacklist is authoritative from here on.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_token(
        &self,
        token: &str,
        ctx: ClientContext,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, AuthzError> {
        let old_claims = self.authorized_claims(token).await?;

        let resolved = self
            .fabric
            .request_with_cancel(
                ResolveUserRequest {
                    external_id: old_claims.sub.clone(),
                    profile_hint: None,
                },
                cancel,
            )
            .await?;
        let user = resolved.user.ok_or(AuthzError::UserNotFound)?;

        let result = self.issue_token_for(&user, false, &ctx, cancel).await?;

        self.fabric
            .request(BlacklistTokenRequest {
                jti: old_claims.jti.clone(),
                reason: "token_refresh".to_string(),
                user_id: Some(user.id),
                organization_id: Some(old_claims.organization.id),
                requested_by: Some(user.id),
                emergency: false,
                expires_at: Some(old_claims.expires_at()),
            })
            .await
            .map_err(|e| AuthzError::TokenBlacklistFailed(anyhow::anyhow!(e)))?;

        self.log_auth_event(
            Some(user.id),
            Some(result.organization.id),
            "TOKEN_REFRESH",
            true,
            serde_json::json!({
                "old_jti": old_claims.jti,
                "new_jti": self.tokens.extract_jti(&result.token).ok(),
            }),
            None,
            &ctx,
        )
        .await;

        Ok(result)
    }

    /// Revoke a bearer token. Parses without full validation so expired or
    /// foreign-signed tokens can still be blacklisted.
    pub async fn revoke_token(
        &self,
        token: &str,
        reason: Option<String>,
        revoked_by: Option<Uuid>,
        ctx: ClientContext,
    ) -> Result<(), AuthzError> {
        let claims = self.tokens.extract_claims_unverified(token)?;
        let reason = reason.unwrap_or_else(|| "revoked".to_string());

        self.fabric
            .request(BlacklistTokenRequest {
                jti: claims.jti.clone(),
                reason: reason.clone(),
                user_id: Some(claims.user.internal_id),
                organization_id: Some(claims.organization.id),
                requested_by: revoked_by,
                emergency: false,
                expires_at: Some(claims.expires_at()),
            })
            .await
            .map_err(|e| AuthzError::TokenBlacklistFailed(anyhow::anyhow!(e)))?;

        self.log_auth_event(
            Some(claims.user.internal_id),
            Some(claims.organization.id),
            "TOKEN_REVOKED",
            true,
            serde_json::json!({ "jti": claims.jti, "reason": reason }),
            None,
            &ctx,
        )
        .await;

        Ok(())
    }

    /// Blanket revocation of every outstanding token for a user.
    pub async fn emergency_revoke_user(
        &self,
        user_id: Uuid,
        requested_by: Option<Uuid>,
        reason: String,
        ctx: ClientContext,
    ) -> Result<i64, AuthzError> {
        let marker_expiry = Utc::now() + chrono::Duration::minutes(self.tokens.expiration_minutes());

        let response = self
            .fabric
            .request(BlacklistTokenRequest {
                jti: emergency_jti(user_id),
                reason: reason.clone(),
                user_id: Some(user_id),
                organization_id: None,
                requested_by,
                emergency: true,
                expires_at: Some(marker_expiry),
            })
            .await
            .map_err(|e| AuthzError::TokenBlacklistFailed(anyhow::anyhow!(e)))?;

        self.log_auth_event(
            Some(user_id),
            None,
            "EMERGENCY_REVOCATION",
            true,
            serde_json::json!({
                "reason": reason,
                "additional_revoked_count": response.additional_revoked_count,
            }),
            None,
            &ctx,
        )
        .await;

        Ok(response.additional_revoked_count)
    }

    /// Steps 4-6 of the flow, shared by login and refresh: pick the
    /// organization, resolve permissions, mint.
    async fn issue_token_for(
        &self,
        user: &User,
        is_new_user: bool,
        ctx: &ClientContext,
        cancel: &CancellationToken,
    ) -> Result<AuthResult, AuthzError> {
        let organizations = self
            .fabric
            .request_with_cancel(
                GetUserOrganizationsRequest {
                    user_id: user.id,
                    include_inherited: true,
                    include_hierarchy: false,
                    status_filter: Some("active".to_string()),
                    limit: None,
                },
                cancel,
            )
            .await?;

        let picked = pick_login_organization(&organizations.organizations)
            .ok_or(AuthzError::NoOrganizationMembership)?;
        let organization = TokenOrganization {
            id: picked.organization_id,
            name: picked.name.clone(),
            path: picked.path.clone(),
        };

        let resolved = self
            .fabric
            .request_with_cancel(
                GetUserPermissionsRequest {
                    user_id: user.id,
                    organization_id: organization.id,
                    include_inherited: true,
                    resource_filter: None,
                    action_filter: None,
                },
                cancel,
            )
            .await?;

        let inherited_count = resolved
            .permissions
            .iter()
            .filter(|p| p.is_inherited())
            .count();
        let permissions: Vec<String> = resolved
            .permissions
            .iter()
            .map(|p| p.permission.clone())
            .collect();

        let minted = self.tokens.mint(MintRequest {
            user: TokenUser::from(user),
            organization: organization.clone(),
            permissions,
            roles: resolved.roles.clone(),
            includes_inherited: true,
            inherited_count,
            source: if is_new_user {
                "first_login".to_string()
            } else {
                "login".to_string()
            },
            client: ctx.clone(),
        })?;

        Ok(AuthResult {
            token: minted.token,
            expires_at: minted.expires_at,
            permissions: minted.claims.permissions.clone(),
            roles: minted.claims.roles.clone(),
            user: minted.claims.user.clone(),
            organization: minted.claims.organization.clone(),
            is_new_user,
        })
    }

    /// Fire-and-forget audit publish. A failed publish never fails the
    /// operation that produced it.
    #[allow(clippy::too_many_arguments)]
    async fn log_auth_event(
        &self,
        user_id: Option<Uuid>,
        organization_id: Option<Uuid>,
        event_type: &str,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
        ctx: &ClientContext,
    ) {
        let event = LogAuthenticationEvent {
            user_id,
            organization_id,
            event_type: event_type.to_string(),
            category: AuditCategory::Authentication.as_str().to_string(),
            success,
            details,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            session_id: ctx.session_id.clone(),
            error,
        };

        if let Err(e) = self.fabric.publish(event).await {
            tracing::error!(error = %e, event_type = event_type, "failed to publish audit event");
        }
    }
}
