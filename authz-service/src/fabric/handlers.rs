//! Handler registry and the core message handlers.
//!
//! Handlers are stateless functions of `(request, Database) -> response`.
//! They are invoked under the consumer's retry policy, so every handler must
//! be idempotent and tolerate re-ordering.

use async_trait::async_trait;
use authz_core::error::AuthzError;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::fabric::messages::{
    BlacklistTokenRequest, BlacklistTokenResponse, CheckTokenBlacklistRequest, CreateUserRequest,
    CreateUserResponse, FabricEvent, FabricMessage, GetUserOrganizationsRequest,
    GetUserOrganizationsResponse, GetUserPermissionsRequest, GetUserPermissionsResponse,
    LogAuthenticationEvent, ResolveUserRequest, ResolveUserResponse, ValidatePermissionRequest,
    ValidatePermissionResponse,
};
use crate::models::{emergency_jti, BlacklistStatus, NewUser, RoleRef};
use crate::services::database::Database;

#[async_trait]
pub trait ErasedHandler: Send + Sync {
    async fn call(
        &self,
        payload: serde_json::Value,
        db: Database,
    ) -> Result<serde_json::Value, AuthzError>;
}

struct TypedHandler<M, F> {
    f: F,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, F, Fut> ErasedHandler for TypedHandler<M, F>
where
    M: FabricMessage,
    F: Fn(M, Database) -> Fut + Send + Sync,
    Fut: Future<Output = Result<M::Response, AuthzError>> + Send,
{
    async fn call(
        &self,
        payload: serde_json::Value,
        db: Database,
    ) -> Result<serde_json::Value, AuthzError> {
        let request: M = serde_json::from_value(payload)?;
        let response = (self.f)(request, db).await?;
        Ok(serde_json::to_value(response)?)
    }
}

struct TypedEventHandler<E, F> {
    f: F,
    _marker: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, F, Fut> ErasedHandler for TypedEventHandler<E, F>
where
    E: FabricEvent,
    F: Fn(E, Database) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AuthzError>> + Send,
{
    async fn call(
        &self,
        payload: serde_json::Value,
        db: Database,
    ) -> Result<serde_json::Value, AuthzError> {
        let event: E = serde_json::from_value(payload)?;
        (self.f)(event, db).await?;
        Ok(serde_json::Value::Null)
    }
}

/// Message name -> handler. Populated once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, F, Fut>(&mut self, f: F)
    where
        M: FabricMessage,
        F: Fn(M, Database) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Response, AuthzError>> + Send + 'static,
    {
        self.handlers.insert(
            M::NAME,
            Arc::new(TypedHandler::<M, F> {
                f,
                _marker: PhantomData,
            }),
        );
    }

    pub fn register_event<E, F, Fut>(&mut self, f: F)
    where
        E: FabricEvent,
        F: Fn(E, Database) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AuthzError>> + Send + 'static,
    {
        self.handlers.insert(
            E::NAME,
            Arc::new(TypedEventHandler::<E, F> {
                f,
                _marker: PhantomData,
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

/// Wire up the catalog handlers.
pub fn register_core_handlers(registry: &mut HandlerRegistry) {
    registry.register(resolve_user);
    registry.register(create_user);
    registry.register(get_user_organizations);
    registry.register(get_user_permissions);
    registry.register(check_token_blacklist);
    registry.register(blacklist_token);
    registry.register(validate_permission);
    registry.register_event(log_authentication_event);
}

async fn resolve_user(
    req: ResolveUserRequest,
    db: Database,
) -> Result<ResolveUserResponse, AuthzError> {
    let user = db.find_user_by_external_id(&req.external_id).await?;
    Ok(ResolveUserResponse { user })
}

async fn create_user(
    req: CreateUserRequest,
    db: Database,
) -> Result<CreateUserResponse, AuthzError> {
    if req.external_id.trim().is_empty() {
        return Err(AuthzError::ExternalIdInvalid("empty external id".to_string()));
    }

    // Idempotent under retry: a concurrent duplicate insert resolves to the
    // existing row.
    let user = match db
        .insert_user(&NewUser {
            external_id: req.external_id.clone(),
            email: req.email.clone(),
            first_name: req.first_name.clone(),
            last_name: req.last_name.clone(),
            profile_picture_url: req.profile_picture_url.clone(),
            source: req.source.clone(),
        })
        .await
    {
        Ok(user) => user,
        Err(AuthzError::ConstraintViolation(_)) => db
            .find_user_by_external_id(&req.external_id)
            .await?
            .ok_or_else(|| {
                AuthzError::UserProvisioningFailed(anyhow::anyhow!(
                    "duplicate insert but user not found"
                ))
            })?,
        Err(e) => return Err(AuthzError::UserProvisioningFailed(anyhow::anyhow!(e))),
    };

    tracing::info!(user_id = %user.id, external_id = %user.external_id, "user provisioned");
    Ok(CreateUserResponse { user })
}

async fn get_user_organizations(
    req: GetUserOrganizationsRequest,
    db: Database,
) -> Result<GetUserOrganizationsResponse, AuthzError> {
    let mut organizations = db
        .get_user_organizations(req.user_id, req.include_inherited)
        .await?;

    if let Some(status) = &req.status_filter {
        organizations.retain(|o| {
            o.membership_status.as_deref() == Some(status.as_str())
                || o.membership_status.is_none()
        });
    }
    if let Some(limit) = req.limit {
        organizations.truncate(limit.max(0) as usize);
    }

    let primary = organizations.iter().find(|o| o.is_primary).cloned();
    Ok(GetUserOrganizationsResponse {
        organizations,
        primary,
    })
}

async fn get_user_permissions(
    req: GetUserPermissionsRequest,
    db: Database,
) -> Result<GetUserPermissionsResponse, AuthzError> {
    let mut permissions = db
        .resolve_user_permissions(req.user_id, req.organization_id, req.include_inherited, None)
        .await?;

    if req.resource_filter.is_some() || req.action_filter.is_some() {
        permissions.retain(|p| {
            let mut parts = p.permission.splitn(2, ':');
            let resource = parts.next().unwrap_or_default();
            let action = parts.next().unwrap_or_default();
            req.resource_filter
                .as_deref()
                .map(|f| f == resource)
                .unwrap_or(true)
                && req
                    .action_filter
                    .as_deref()
                    .map(|f| f == action)
                    .unwrap_or(true)
        });
    }

    let mut roles: Vec<RoleRef> = Vec::new();
    for p in &permissions {
        if !roles.iter().any(|r| r.id == p.role_id) {
            roles.push(RoleRef {
                id: p.role_id,
                name: p.role_name.clone(),
                is_inheritable: p.is_inheritable,
            });
        }
    }

    Ok(GetUserPermissionsResponse { permissions, roles })
}

async fn check_token_blacklist(
    req: CheckTokenBlacklistRequest,
    db: Database,
) -> Result<BlacklistStatus, AuthzError> {
    if let Some(entry) = db.find_blacklist_entry(&req.jti).await? {
        return Ok(BlacklistStatus {
            is_blacklisted: true,
            reason: Some(entry.reason),
            blacklisted_at: Some(entry.revoked_at),
        });
    }

    // Blanket revocation marker for the token's user, when known.
    if let Some(user_id) = req.user_id {
        if let Some(marker) = db.find_blacklist_entry(&emergency_jti(user_id)).await? {
            return Ok(BlacklistStatus {
                is_blacklisted: true,
                reason: Some(marker.reason),
                blacklisted_at: Some(marker.revoked_at),
            });
        }
    }

    Ok(BlacklistStatus::clear())
}

async fn blacklist_token(
    req: BlacklistTokenRequest,
    db: Database,
) -> Result<BlacklistTokenResponse, AuthzError> {
    if req.emergency {
        let user_id = req.user_id.ok_or_else(|| {
            AuthzError::ConstraintViolation(
                "emergency revocation requires a user id".to_string(),
            )
        })?;

        db.blacklist_token(
            &req.jti,
            req.user_id,
            req.organization_id,
            req.requested_by,
            &req.reason,
            req.expires_at,
        )
        .await?;

        let active_entries = db
            .emergency_revoke_user_tokens(user_id, req.requested_by, &req.reason, req.expires_at)
            .await?;

        tracing::warn!(user_id = %user_id, "emergency token revocation");
        return Ok(BlacklistTokenResponse {
            acknowledged: true,
            additional_revoked_count: i64::from(active_entries.max(1) - 1),
        });
    }

    let acknowledged = db
        .blacklist_token(
            &req.jti,
            req.user_id,
            req.organization_id,
            req.requested_by,
            &req.reason,
            req.expires_at,
        )
        .await?;

    Ok(BlacklistTokenResponse {
        acknowledged,
        additional_revoked_count: 0,
    })
}

async fn validate_permission(
    req: ValidatePermissionRequest,
    db: Database,
) -> Result<ValidatePermissionResponse, AuthzError> {
    if db
        .check_user_permission(req.user_id, req.organization_id, &req.permission)
        .await?
    {
        return Ok(ValidatePermissionResponse {
            allowed: true,
            reason: None,
        });
    }

    for alternative in &req.alternatives {
        if db
            .check_user_permission(req.user_id, req.organization_id, alternative)
            .await?
        {
            return Ok(ValidatePermissionResponse {
                allowed: true,
                reason: Some(format!("granted via alternative {}", alternative)),
            });
        }
    }

    Ok(ValidatePermissionResponse {
        allowed: false,
        reason: Some(format!("missing permission {}", req.permission)),
    })
}

/// At-least-once: a failing write is retried by the consumer and eventually
/// dead-lettered; the publisher never waits on it.
async fn log_authentication_event(
    event: LogAuthenticationEvent,
    db: Database,
) -> Result<(), AuthzError> {
    db.log_audit_event(
        &event.event_type,
        &event.category,
        event.user_id,
        event.organization_id,
        None,
        None,
        None,
        if event.success { "success" } else { "failure" },
        &serde_json::json!({
            "details": event.details,
            "error": event.error,
        }),
        event.ip_address.as_deref(),
        event.user_agent.as_deref(),
        event.session_id.as_deref(),
        None,
    )
    .await?;
    Ok(())
}
