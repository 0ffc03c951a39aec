//! Typed message catalog for the fabric.
//!
//! Each request type is linked to its response type through the
//! `FabricMessage` trait; fire-and-forget events implement `FabricEvent`.
//! Messages travel as JSON envelopes carrying a correlation id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BlacklistStatus, ResolvedPermission, RoleRef, User, UserOrganization};
use crate::services::idp::IdpProfile;

/// A request/reply message. `NAME` doubles as the queue name.
pub trait FabricMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// A fire-and-forget event.
pub trait FabricEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// On-the-wire request envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Uuid,
    pub message: String,
    pub payload: serde_json::Value,
}

/// On-the-wire reply envelope: exactly one of `ok`/`err` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: Uuid,
    pub ok: Option<serde_json::Value>,
    pub err: Option<WireFailure>,
}

/// A typed failure crossing the fabric; reconstructed into the taxonomy on
/// the client side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFailure {
    pub code: u16,
    pub message: String,
}

// ==================== Request/reply messages ====================

/// Resolve an external identity to an internal user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveUserRequest {
    pub external_id: String,
    /// Profile hint from a just-completed IdP exchange; lets the handler
    /// log richer context. Resolution itself keys on `external_id` only.
    pub profile_hint: Option<IdpProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveUserResponse {
    /// The user, or None when the external id is unknown.
    pub user: Option<User>,
}

impl FabricMessage for ResolveUserRequest {
    const NAME: &'static str = "authz.resolve_user";
    type Response = ResolveUserResponse;
}

/// Provision a new user from an IdP profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub external_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_picture_url: Option<String>,
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user: User,
}

impl FabricMessage for CreateUserRequest {
    const NAME: &'static str = "authz.create_user";
    type Response = CreateUserResponse;
}

/// List the organizations a user can act in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserOrganizationsRequest {
    pub user_id: Uuid,
    pub include_inherited: bool,
    /// Also include subtree counts; reserved for richer listings.
    #[serde(default)]
    pub include_hierarchy: bool,
    pub status_filter: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserOrganizationsResponse {
    pub organizations: Vec<UserOrganization>,
    pub primary: Option<UserOrganization>,
}

impl FabricMessage for GetUserOrganizationsRequest {
    const NAME: &'static str = "authz.get_user_organizations";
    type Response = GetUserOrganizationsResponse;
}

/// Resolve effective permissions for (user, organization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserPermissionsRequest {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub include_inherited: bool,
    pub resource_filter: Option<String>,
    pub action_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserPermissionsResponse {
    pub permissions: Vec<ResolvedPermission>,
    /// Distinct roles contributing to the set, in first-seen order.
    pub roles: Vec<RoleRef>,
}

impl FabricMessage for GetUserPermissionsRequest {
    const NAME: &'static str = "authz.get_user_permissions";
    type Response = GetUserPermissionsResponse;
}

/// Blacklist lookup for a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTokenBlacklistRequest {
    pub jti: String,
    /// When set, the per-user emergency marker is consulted too.
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
}

impl FabricMessage for CheckTokenBlacklistRequest {
    const NAME: &'static str = "authz.check_token_blacklist";
    type Response = BlacklistStatus;
}

/// Revoke a token, or every token of a user when `emergency` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistTokenRequest {
    pub jti: String,
    pub reason: String,
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub requested_by: Option<Uuid>,
    #[serde(default)]
    pub emergency: bool,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistTokenResponse {
    pub acknowledged: bool,
    /// Active blacklist entries beyond the requested jti (emergency only).
    pub additional_revoked_count: i64,
}

impl FabricMessage for BlacklistTokenRequest {
    const NAME: &'static str = "authz.blacklist_token";
    type Response = BlacklistTokenResponse;
}

/// Data-driven permission validation with fallback alternatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatePermissionRequest {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub permission: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatePermissionResponse {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl FabricMessage for ValidatePermissionRequest {
    const NAME: &'static str = "authz.validate_permission";
    type Response = ValidatePermissionResponse;
}

// ==================== Events ====================

/// Authentication/authorization audit event, published fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogAuthenticationEvent {
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub event_type: String,
    /// One of the audit categories (e.g. AUTHENTICATION).
    pub category: String,
    pub success: bool,
    #[serde(default)]
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl FabricEvent for LogAuthenticationEvent {
    const NAME: &'static str = "authz.log_authentication_event";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            correlation_id: Uuid::new_v4(),
            message: ResolveUserRequest::NAME.to_string(),
            payload: serde_json::json!({ "external_id": "idp|1", "profile_hint": null }),
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.correlation_id, envelope.correlation_id);
        assert_eq!(back.message, "authz.resolve_user");

        let req: ResolveUserRequest = serde_json::from_value(back.payload).unwrap();
        assert_eq!(req.external_id, "idp|1");
    }

    #[test]
    fn test_queue_names_are_distinct() {
        let names = [
            ResolveUserRequest::NAME,
            CreateUserRequest::NAME,
            GetUserOrganizationsRequest::NAME,
            GetUserPermissionsRequest::NAME,
            CheckTokenBlacklistRequest::NAME,
            BlacklistTokenRequest::NAME,
            ValidatePermissionRequest::NAME,
            LogAuthenticationEvent::NAME,
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
